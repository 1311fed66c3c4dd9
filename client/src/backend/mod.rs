use async_trait::async_trait;
use thiserror::Error;

use crate::ac::AcError;
use crate::tunnel::config::ConfigError;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelState};

pub mod wg;

pub use wg::WgBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid tunnel configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("WireGuard device error: {0}")]
    Device(String),

    #[error("network interface error: {0}")]
    Interface(String),

    #[error("auto-configure exchange failed: {0}")]
    AutoConfigure(#[from] AcError),

    #[error("no auto connection to release at {0}")]
    NotConnected(String),
}

/// Operations the tunnel registry and the auto-connect procedure need from
/// the WireGuard side.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Ask the auto-configure server at `server_ip:server_port` for a tunnel.
    ///
    /// With `TunnelState::Up` this negotiates and returns a configuration,
    /// `None` meaning the negotiation failed. With `TunnelState::Down` the
    /// server is told to release the client and `None` is returned.
    async fn set_ac(
        &self,
        server_ip: &str,
        server_port: &str,
        state: TunnelState,
    ) -> Option<TunnelConfig>;

    /// Tell the server at `server_ip:server_port` to release this client.
    ///
    /// Unlike `set_ac` with `TunnelState::Down`, the outcome is reported.
    async fn release(&self, server_ip: &str, server_port: &str) -> Result<(), BackendError>;

    /// Apply `state` to the tunnel's device and return the state reached.
    async fn set_state(&self, tunnel: &Tunnel, state: TunnelState)
    -> Result<TunnelState, BackendError>;
}
