use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use wgac_shared::ac::DEFAULT_WG_PORT;

pub mod server;
pub use server::ServerConfig;

/// Configuration for the client daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Path to the daemon socket file to listen on
    pub daemon_socket: PathBuf,

    /// Directory for working data storage
    pub data_dir: PathBuf,

    /// Auto-connect wizard settings
    pub auto_connect: AutoConnectSettings,

    /// How tunnel devices are created
    pub interface: InterfaceSettings,
}

/// Settings of the auto-connect procedure and of the auto-configure exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoConnectSettings {
    /// Name of the tunnel the wizard creates
    pub tunnel_name: String,

    /// WireGuard listen port advertised to the server and put in the config
    pub listen_port: u16,

    pub connect_timeout_secs: u64,

    pub io_timeout_secs: u64,

    /// Attempts for connecting, and again for the exchange itself
    pub attempts: u32,

    pub retry_delay_secs: u64,

    /// Networks always offered to the server besides the local /16
    pub base_allowed_ips: Vec<IpNet>,

    /// Interface whose hardware address identifies the client
    pub mac_interface: Option<String>,

    /// Hardware address sent when none can be read
    pub fallback_mac: Option<String>,
}

/// Tunnel device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    /// Use the userspace WireGuard implementation even where the kernel has one
    pub force_userspace: bool,

    /// MTU used when the tunnel config has none
    pub default_mtu: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            daemon_socket: PathBuf::from("/tmp/wgac-client.sock"),
            data_dir: PathBuf::from("/var/lib/wgac-client"),
            auto_connect: AutoConnectSettings::default(),
            interface: InterfaceSettings::default(),
        }
    }
}

impl Default for AutoConnectSettings {
    fn default() -> Self {
        AutoConnectSettings {
            tunnel_name: "wg0".to_string(),
            listen_port: DEFAULT_WG_PORT,
            connect_timeout_secs: 3,
            io_timeout_secs: 5,
            attempts: 2,
            retry_delay_secs: 2,
            base_allowed_ips: "10.1.0.0/16".parse::<IpNet>().into_iter().collect(),
            mac_interface: None,
            fallback_mac: None,
        }
    }
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        InterfaceSettings {
            force_userspace: false,
            default_mtu: 1420,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!("Configuration file not found: {:?}", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(&self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert configuration to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self)
    }

    /// Directory holding one `.conf` file per tunnel
    pub fn tunnels_dir(&self) -> PathBuf {
        self.data_dir.join("tunnels")
    }
}
