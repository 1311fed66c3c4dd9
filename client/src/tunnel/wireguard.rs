use std::net::SocketAddr;
use std::str::FromStr;
use tracing::debug;
use wireguard_control::{
    Backend as WgImpl, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

use crate::backend::BackendError;
use crate::tunnel::config::{ConfigError, TunnelConfig};
use crate::tunnel::shared::OsTunnel;

#[cfg(target_os = "linux")]
const BACKEND: WgImpl = WgImpl::Kernel;
#[cfg(target_os = "openbsd")]
const BACKEND: WgImpl = WgImpl::OpenBSD;
#[cfg(not(any(target_os = "linux", target_os = "openbsd")))]
const BACKEND: WgImpl = WgImpl::Userspace;

/// A WireGuard device configured from a [`TunnelConfig`]
pub struct WireGuardTunnel {
    interface: String,
    config: TunnelConfig,
    force_userspace: bool,
}

fn parse_key(what: &'static str, value: &str) -> Result<Key, BackendError> {
    Key::from_base64(value).map_err(|_| {
        BackendError::Config(ConfigError::InvalidValue {
            what,
            value: value.to_string(),
        })
    })
}

impl WireGuardTunnel {
    pub fn new(interface: String, config: TunnelConfig, force_userspace: bool) -> Self {
        Self {
            interface,
            config,
            force_userspace,
        }
    }

    fn wg_backend(&self) -> WgImpl {
        if self.force_userspace {
            WgImpl::Userspace
        } else {
            BACKEND
        }
    }

    fn ifname(&self) -> Result<InterfaceName, BackendError> {
        InterfaceName::from_str(self.interface.as_str()).map_err(|_| {
            BackendError::Device(format!("invalid interface name {:?}", self.interface))
        })
    }

    async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, BackendError> {
        if let Ok(addr) = endpoint.parse::<SocketAddr>() {
            return Ok(addr);
        }
        tokio::net::lookup_host(endpoint)
            .await
            .map_err(|e| BackendError::Device(format!("failed to resolve {}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| BackendError::Device(format!("no address for endpoint {}", endpoint)))
    }
}

impl OsTunnel for WireGuardTunnel {
    async fn setup(&mut self) -> Result<(), BackendError> {
        let ifname = self.ifname()?;

        // Resolve everything before building the update
        let mut endpoints = Vec::with_capacity(self.config.peers.len());
        for peer in &self.config.peers {
            endpoints.push(match &peer.endpoint {
                Some(endpoint) => Some(Self::resolve_endpoint(endpoint).await?),
                None => None,
            });
        }

        let mut device = DeviceUpdate::new().replace_peers();

        for (peer, endpoint) in self.config.peers.iter().zip(endpoints) {
            let mut peer_config =
                PeerConfigBuilder::new(&parse_key("PublicKey", &peer.public_key)?);
            for net in &peer.allowed_ips {
                peer_config = peer_config.add_allowed_ip(net.addr(), net.prefix_len());
            }
            if let Some(psk) = &peer.preshared_key {
                peer_config = peer_config.set_preshared_key(parse_key("PresharedKey", psk)?);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                peer_config = peer_config.set_persistent_keepalive_interval(keepalive);
            }
            if let Some(endpoint) = endpoint {
                peer_config = peer_config.set_endpoint(endpoint);
            }
            device = device.add_peer(peer_config);
        }

        if let Some(listen_port) = self.config.interface.listen_port {
            device = device.set_listen_port(listen_port);
        }

        device
            .set_private_key(parse_key("PrivateKey", &self.config.interface.private_key)?)
            .apply(&ifname, self.wg_backend())
            .map_err(|e| BackendError::Device(format!("failed to configure {}: {}", self.interface, e)))?;

        debug!("Configured WireGuard device {}", self.interface);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), BackendError> {
        let ifname = self.ifname()?;
        Device::get(&ifname, self.wg_backend())
            .and_then(|device| device.delete())
            .map_err(|e| BackendError::Device(format!("failed to delete {}: {}", self.interface, e)))?;

        debug!("Deleted WireGuard device {}", self.interface);
        Ok(())
    }

    fn get_interface_name(&self) -> &str {
        self.interface.as_str()
    }

    fn is_ift_created(&self) -> bool {
        match self.ifname() {
            Ok(ifname) => Device::get(&ifname, self.wg_backend()).is_ok(),
            Err(_) => false,
        }
    }
}
