use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

use super::protocol::{DaemonRequest, DaemonResponse, IpcMessage, SharedSecret, read_frame, write_frame};

/// Client for communicating with the daemon via Unix socket
pub struct DaemonClient {
    socket_path: PathBuf,
    secret: String,
}

impl DaemonClient {
    /// Create a client using the secret the daemon left in `data_dir`
    pub fn new(socket_path: &Path, data_dir: &Path) -> io::Result<Self> {
        let secret = SharedSecret::load(data_dir)?;
        Ok(DaemonClient {
            socket_path: socket_path.to_path_buf(),
            secret: secret.value().to_string(),
        })
    }

    /// Send a request to the daemon and wait for response
    pub async fn send_request(&self, request: DaemonRequest) -> io::Result<DaemonResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Failed to connect to daemon at {:?}: {}", self.socket_path, e),
            )
        })?;

        let message = IpcMessage {
            secret: self.secret.clone(),
            request,
        };
        write_frame(&mut stream, &message).await?;
        read_frame(&mut stream).await
    }
}
