use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tunnel::TunnelState;

/// Request sent from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonRequest {
    /// Get daemon status
    Status,
    /// Run the auto-connect procedure against a server
    AutoConnect {
        server_ip: String,
        server_port: String,
    },
    /// Release the auto connection at the last used server
    Disconnect,
    ListTunnels,
    /// Get the wg-quick text of one tunnel
    ShowTunnel { name: String },
    SetTunnelState { name: String, state: TunnelState },
    DeleteTunnel { name: String },
    /// Get the last used auto-configure server
    GetServer,
    /// Get daemon configuration
    GetConfig,
}

/// One row of a tunnel listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSummary {
    pub name: String,
    pub state: TunnelState,
    pub addresses: Vec<String>,
    pub endpoint: Option<String>,
}

/// Response sent from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Success with optional message
    Ok(Option<String>),
    /// Error with message
    Error(String),
    /// Status information
    Status {
        running: bool,
        tunnels: usize,
        tunnels_up: usize,
        server: Option<String>,
    },
    /// Outcome of an auto-connect attempt: the notifications shown and
    /// whether the wizard was dismissed
    AutoConnect {
        success: bool,
        messages: Vec<String>,
        dismissed: bool,
    },
    Tunnels(Vec<TunnelSummary>),
    TunnelConfig(String),
    TunnelState { name: String, state: TunnelState },
    /// Last used auto-configure server
    ServerConfig {
        server_ip: String,
        server_port: String,
    },
    /// Daemon configuration details
    Config(serde_json::Value),
}

/// IPC message envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct IpcMessage {
    pub secret: String,
    pub request: DaemonRequest,
}

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Write `value` as JSON behind a 4-byte big-endian length
pub async fn write_frame<W, T>(stream: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("Failed to serialize: {}", e))
    })?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Message too large"));
    }

    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Read one frame written by [`write_frame`]
pub async fn read_frame<R, T>(stream: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Message too large"));
    }

    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    serde_json::from_slice(&buffer)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Invalid JSON: {}", e)))
}

/// Shared secret for CLI-daemon authentication
pub struct SharedSecret {
    pub secret: String,
}

impl SharedSecret {
    /// Create a new shared secret
    pub fn generate() -> String {
        use rand::Rng;
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                                  abcdefghijklmnopqrstuvwxyz\
                                  0123456789";
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| {
                let idx = rng.gen_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }

    /// Load shared secret from file
    pub fn load(data_dir: &Path) -> io::Result<Self> {
        let secret_path = data_dir.join(".daemon_secret");
        if !secret_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "Daemon secret not found",
            ));
        }
        let secret = fs::read_to_string(secret_path)?;
        Ok(SharedSecret {
            secret: secret.trim().to_string(),
        })
    }

    /// Save shared secret to file, readable by the owner only
    pub fn save(&self, data_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(data_dir)?;
        let secret_path = data_dir.join(".daemon_secret");
        fs::write(&secret_path, &self.secret)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Compare in constant time
    pub fn verify(&self, secret: &str) -> bool {
        self.secret.len() == secret.len()
            && self
                .secret
                .bytes()
                .zip(secret.bytes())
                .fold(0, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn value(&self) -> &str {
        &self.secret
    }
}
