use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod manager;
pub mod shared;
pub mod store;
pub mod wireguard;

pub use config::TunnelConfig;
pub use manager::{ManagerError, TunnelManager};
pub use store::FileConfigStore;

/// Operational state of a tunnel.
///
/// `Toggle` is only ever requested; a tunnel is never recorded as toggled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    Down,
    Up,
    Toggle,
}

impl TunnelState {
    /// Resolve a requested state against the current one
    pub fn resolve(self, current: TunnelState) -> TunnelState {
        match self {
            TunnelState::Toggle => match current {
                TunnelState::Up => TunnelState::Down,
                _ => TunnelState::Up,
            },
            other => other,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Down => f.write_str("down"),
            TunnelState::Up => f.write_str("up"),
            TunnelState::Toggle => f.write_str("toggle"),
        }
    }
}

/// Identity of a registered tunnel, stable across renames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId(pub u64);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named tunnel as held by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub id: TunnelId,
    pub name: String,
    pub config: TunnelConfig,
    pub state: TunnelState,
}

/// Names must also be valid network interface names
pub fn is_name_invalid(name: &str) -> bool {
    name.is_empty()
        || name.len() > 15
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_resolve() {
        assert_eq!(TunnelState::Toggle.resolve(TunnelState::Up), TunnelState::Down);
        assert_eq!(TunnelState::Toggle.resolve(TunnelState::Down), TunnelState::Up);
        assert_eq!(TunnelState::Up.resolve(TunnelState::Up), TunnelState::Up);
    }

    #[test]
    fn test_tunnel_names() {
        assert!(!is_name_invalid("wg0"));
        assert!(!is_name_invalid("office-vpn_2.b"));
        assert!(is_name_invalid(""));
        assert!(is_name_invalid("sixteen-chars-xx"));
        assert!(is_name_invalid("has space"));
        assert!(is_name_invalid("slash/name"));
    }
}
