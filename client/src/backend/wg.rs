use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};
use wireguard_control::Key;

use super::{Backend, BackendError};
use crate::ac::AcClient;
use crate::config::{AutoConnectSettings, InterfaceSettings};
use crate::interface;
use crate::tunnel::config::ConfigError;
use crate::tunnel::shared::OsTunnel;
use crate::tunnel::wireguard::WireGuardTunnel;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelState};

/// Backend that negotiates with auto-configure servers and drives WireGuard
/// devices through `wireguard-control` and rtnetlink.
pub struct WgBackend {
    ac: AcClient,
    interface: InterfaceSettings,
    /// Private key handed to each server, keyed by `ip:port`
    keys: Mutex<HashMap<String, Key>>,
}

fn server_key(server_ip: &str, server_port: &str) -> String {
    format!("{}:{}", server_ip.trim(), server_port.trim())
}

/// State to move a device in `current` to, or `None` if it is already there
fn transition(current: TunnelState, requested: TunnelState) -> Option<TunnelState> {
    let target = requested.resolve(current);
    (target != current).then_some(target)
}

impl WgBackend {
    pub fn new(settings: AutoConnectSettings, interface: InterfaceSettings) -> Self {
        Self {
            ac: AcClient::new(settings),
            interface,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Remember the key of a configuration obtained from a server earlier,
    /// so it can be released after a restart.
    pub fn adopt(
        &self,
        server_ip: &str,
        server_port: &str,
        config: &TunnelConfig,
    ) -> Result<(), ConfigError> {
        let key = Key::from_base64(&config.interface.private_key).map_err(|_| {
            ConfigError::InvalidValue {
                what: "PrivateKey",
                value: config.interface.private_key.clone(),
            }
        })?;
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(server_key(server_ip, server_port), key);
        }
        Ok(())
    }

    fn has_key(&self, server: &str) -> bool {
        self.keys
            .lock()
            .map(|keys| keys.contains_key(server))
            .unwrap_or(false)
    }

    fn take_key(&self, server: &str) -> Option<Key> {
        self.keys.lock().ok().and_then(|mut keys| keys.remove(server))
    }

    fn store_key(&self, server: String, key: Key) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(server, key);
        }
    }

    async fn bring_up(&self, tunnel: &Tunnel) -> Result<(), BackendError> {
        let mut os_tun = WireGuardTunnel::new(
            tunnel.name.clone(),
            tunnel.config.clone(),
            self.interface.force_userspace,
        );
        os_tun.setup().await?;

        let ifname = os_tun.get_interface_name().to_string();
        let mtu = tunnel
            .config
            .interface
            .mtu
            .unwrap_or(self.interface.default_mtu);

        let result = async {
            interface::add_addrs(&ifname, &tunnel.config.interface.addresses).await?;
            interface::link_up_with_mtu(&ifname, mtu).await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = os_tun.destroy().await {
                warn!("Failed to clean up {} after error: {}", ifname, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for WgBackend {
    async fn set_ac(
        &self,
        server_ip: &str,
        server_port: &str,
        state: TunnelState,
    ) -> Option<TunnelConfig> {
        let server = server_key(server_ip, server_port);
        let current = if self.has_key(&server) {
            TunnelState::Up
        } else {
            TunnelState::Down
        };

        match state.resolve(current) {
            TunnelState::Down => {
                if let Err(e) = self.release(server_ip, server_port).await {
                    warn!("Failed to release auto connection at {}: {}", server, e);
                }
                None
            }
            _ => {
                let key = Key::generate_private();
                match self.ac.turn_on(server_ip, server_port, &key).await {
                    Ok(config) => {
                        self.store_key(server, key);
                        Some(config)
                    }
                    Err(e) => {
                        error!("Auto connection to {} failed: {}", server, e);
                        None
                    }
                }
            }
        }
    }

    async fn release(&self, server_ip: &str, server_port: &str) -> Result<(), BackendError> {
        let server = server_key(server_ip, server_port);
        let Some(key) = self.take_key(&server) else {
            return Err(BackendError::NotConnected(server));
        };

        let public = key.get_public().to_base64();
        if let Err(e) = self.ac.turn_off(server_ip, server_port, &public).await {
            // Kept so the release can be retried
            self.store_key(server, key);
            return Err(e.into());
        }
        Ok(())
    }

    async fn set_state(
        &self,
        tunnel: &Tunnel,
        state: TunnelState,
    ) -> Result<TunnelState, BackendError> {
        let mut os_tun = WireGuardTunnel::new(
            tunnel.name.clone(),
            tunnel.config.clone(),
            self.interface.force_userspace,
        );
        let current = if os_tun.is_ift_created() {
            TunnelState::Up
        } else {
            TunnelState::Down
        };

        let Some(target) = transition(current, state) else {
            debug!("Device {} is already {}", tunnel.name, current);
            return Ok(current);
        };

        match target {
            TunnelState::Down => {
                os_tun.destroy().await?;
                info!("Tunnel {} brought down", tunnel.name);
                Ok(TunnelState::Down)
            }
            _ => {
                self.bring_up(tunnel).await?;
                info!("Tunnel {} brought up", tunnel.name);
                Ok(TunnelState::Up)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> WgBackend {
        WgBackend::new(
            AutoConnectSettings {
                attempts: 1,
                retry_delay_secs: 0,
                connect_timeout_secs: 1,
                ..Default::default()
            },
            InterfaceSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_set_ac_with_empty_address() {
        let backend = backend();
        assert!(backend.set_ac("", "", TunnelState::Up).await.is_none());
        assert!(!backend.has_key(":"));
    }

    #[tokio::test]
    async fn test_release_without_key_is_noop() {
        let backend = backend();
        assert!(
            backend
                .set_ac("203.0.113.5", "51820", TunnelState::Down)
                .await
                .is_none()
        );
    }

    #[test]
    fn test_transition_skips_current_state() {
        assert_eq!(transition(TunnelState::Up, TunnelState::Up), None);
        assert_eq!(transition(TunnelState::Down, TunnelState::Down), None);
        assert_eq!(transition(TunnelState::Down, TunnelState::Up), Some(TunnelState::Up));
        assert_eq!(transition(TunnelState::Up, TunnelState::Toggle), Some(TunnelState::Down));
        assert_eq!(transition(TunnelState::Up, TunnelState::Down), Some(TunnelState::Down));
    }

    #[tokio::test]
    async fn test_release_unreachable_server_keeps_key() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let backend = backend();
        let config = TunnelConfig::new(Key::generate_private().to_base64());
        backend.adopt("127.0.0.1", &port, &config).unwrap();

        let result = backend.release("127.0.0.1", &port).await;
        assert!(matches!(result, Err(BackendError::AutoConfigure(_))));
        assert!(backend.has_key(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_release_without_key() {
        let backend = backend();
        assert!(matches!(
            backend.release("203.0.113.5", "51820").await,
            Err(BackendError::NotConnected(_))
        ));
    }

    #[test]
    fn test_adopt_remembers_key() {
        let backend = backend();
        let config = TunnelConfig::new(Key::generate_private().to_base64());
        backend.adopt("203.0.113.5", " 51820", &config).unwrap();
        assert!(backend.has_key("203.0.113.5:51820"));

        let bad = TunnelConfig::new("nope".to_string());
        assert!(backend.adopt("203.0.113.5", "51820", &bad).is_err());
    }
}
