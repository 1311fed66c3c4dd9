use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// The auto-configure server last used successfully, stored in the work directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server IP address or host name, as typed by the user
    pub server_ip: String,

    /// Server port, as typed by the user
    pub server_port: String,
}

impl ServerConfig {
    pub fn new(server_ip: String, server_port: String) -> Self {
        Self {
            server_ip,
            server_port,
        }
    }

    /// Load server configuration from file
    pub fn load(data_dir: &Path) -> io::Result<Self> {
        let config_path = data_dir.join("server.json");
        if !config_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "Server configuration not found",
            ));
        }

        let content = fs::read_to_string(config_path)?;
        serde_json::from_str(&content).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, e.to_string())
        })
    }

    /// Save server configuration to file
    pub fn save(&self, data_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join("server.json");
        let content = serde_json::to_string_pretty(&self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        fs::write(config_path, content)?;
        Ok(())
    }

    /// Delete server configuration
    pub fn delete(data_dir: &Path) -> io::Result<()> {
        let config_path = data_dir.join("server.json");
        if config_path.exists() {
            fs::remove_file(config_path)?;
        }
        Ok(())
    }

    /// `ip:port` as shown to the user
    pub fn address(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }
}
