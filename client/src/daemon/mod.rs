use std::future::{self, Future};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::autoconnect::{AutoConnect, Notifier, Surface};
use crate::backend::{Backend, BackendError, WgBackend};
use crate::config::{ClientConfig, ServerConfig};
use crate::tunnel::{FileConfigStore, Tunnel, TunnelManager, TunnelState};

pub mod client;
pub mod protocol;

use protocol::{DaemonRequest, DaemonResponse, IpcMessage, SharedSecret, TunnelSummary, read_frame, write_frame};

/// Daemon state and management
pub struct Daemon {
    config: ClientConfig,
    server_config: Mutex<Option<ServerConfig>>,
    secret: SharedSecret,
    manager: Arc<TunnelManager>,
    backend: Arc<dyn Backend>,
    auto_connect: Arc<AutoConnect>,
}

/// Collects what the auto-connect procedure shows during one request
#[derive(Default)]
struct WizardSession {
    messages: StdMutex<Vec<String>>,
    dismissed: AtomicBool,
}

impl Notifier for WizardSession {
    fn show_message(&self, text: &str) {
        info!("{}", text);
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(text.to_string());
        }
    }
}

impl Surface for WizardSession {
    fn dismiss(&self) {
        self.dismissed.store(true, Ordering::SeqCst);
    }
}

impl WizardSession {
    fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    fn dismissed(&self) -> bool {
        self.dismissed.load(Ordering::SeqCst)
    }
}

fn summarize(tunnel: Tunnel) -> TunnelSummary {
    TunnelSummary {
        addresses: tunnel
            .config
            .interface
            .addresses
            .iter()
            .map(|a| a.to_string())
            .collect(),
        endpoint: tunnel.config.peers.iter().find_map(|p| p.endpoint.clone()),
        name: tunnel.name,
        state: tunnel.state,
    }
}

impl Daemon {
    /// Create a daemon driving real WireGuard devices
    pub async fn new(config: ClientConfig) -> io::Result<Self> {
        let backend = Arc::new(WgBackend::new(
            config.auto_connect.clone(),
            config.interface.clone(),
        ));
        let daemon = Self::with_backend(config, backend.clone()).await?;

        // Let a restarted daemon still release the connection it obtained
        let server = daemon.server_config.lock().await.clone();
        if let Some(server) = server {
            if let Some(tunnel) = daemon.manager.get(daemon.auto_connect.tunnel_name()).await {
                match backend.adopt(&server.server_ip, &server.server_port, &tunnel.config) {
                    Ok(()) => debug!("Adopted {} for {}", tunnel.name, server.address()),
                    Err(e) => warn!("Cannot adopt {}: {}", tunnel.name, e),
                }
            }
        }

        Ok(daemon)
    }

    pub async fn with_backend(config: ClientConfig, backend: Arc<dyn Backend>) -> io::Result<Self> {
        let secret = match SharedSecret::load(&config.data_dir) {
            Ok(s) => s,
            Err(_) => {
                let secret = SharedSecret {
                    secret: SharedSecret::generate(),
                };
                secret.save(&config.data_dir)?;
                secret
            }
        };

        let server_config = ServerConfig::load(&config.data_dir).ok();

        let store = FileConfigStore::new(config.tunnels_dir());
        let manager = Arc::new(TunnelManager::new(Box::new(store), backend.clone()));
        let loaded = manager.load().await.map_err(io::Error::other)?;
        info!("Loaded {} tunnel(s) from {:?}", loaded, config.tunnels_dir());

        let auto_connect = Arc::new(AutoConnect::new(
            manager.clone(),
            backend.clone(),
            config.auto_connect.tunnel_name.clone(),
        ));

        Ok(Daemon {
            config,
            server_config: Mutex::new(server_config),
            secret,
            manager,
            backend,
            auto_connect,
        })
    }

    /// Handle a request from the CLI
    pub async fn handle_request(&self, req: DaemonRequest, auth_secret: &str) -> DaemonResponse {
        self.handle_request_until(req, auth_secret, future::pending()).await
    }

    /// Handle a request, cancelling an auto connection once `hangup` resolves
    pub async fn handle_request_until<F>(
        &self,
        req: DaemonRequest,
        auth_secret: &str,
        hangup: F,
    ) -> DaemonResponse
    where
        F: Future<Output = ()>,
    {
        if !self.secret.verify(auth_secret) {
            return DaemonResponse::Error("Authentication failed".to_string());
        }

        match req {
            DaemonRequest::Status => self.handle_status().await,
            DaemonRequest::AutoConnect {
                server_ip,
                server_port,
            } => self.handle_auto_connect(server_ip, server_port, hangup).await,
            DaemonRequest::Disconnect => self.handle_disconnect().await,
            DaemonRequest::ListTunnels => self.handle_list().await,
            DaemonRequest::ShowTunnel { name } => self.handle_show(&name).await,
            DaemonRequest::SetTunnelState { name, state } => self.handle_set_state(name, state).await,
            DaemonRequest::DeleteTunnel { name } => self.handle_delete(&name).await,
            DaemonRequest::GetServer => self.handle_get_server().await,
            DaemonRequest::GetConfig => self.handle_get_config().await,
        }
    }

    async fn handle_status(&self) -> DaemonResponse {
        let tunnels = self.manager.list().await;
        let server = self.server_config.lock().await.as_ref().map(|s| s.address());

        DaemonResponse::Status {
            running: true,
            tunnels_up: tunnels.iter().filter(|t| t.state == TunnelState::Up).count(),
            tunnels: tunnels.len(),
            server,
        }
    }

    async fn handle_auto_connect<F>(
        &self,
        server_ip: String,
        server_port: String,
        hangup: F,
    ) -> DaemonResponse
    where
        F: Future<Output = ()>,
    {
        let session = Arc::new(WizardSession::default());
        let mut handle = self.auto_connect.clone().launch(
            server_ip.clone(),
            server_port.clone(),
            session.clone(),
            session.clone(),
        );

        tokio::pin!(hangup);
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = &mut hangup => {
                handle.abort();
                (&mut handle).await
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                info!("Auto connection to {}:{} cancelled by client", server_ip, server_port);
                return DaemonResponse::Error("Auto connection cancelled".to_string());
            }
            Err(e) => return DaemonResponse::Error(format!("Auto connection task failed: {}", e)),
        };

        if let Err(e) = &result {
            debug!("Auto connection to {}:{} did not complete: {}", server_ip, server_port, e);
        } else {
            let server = ServerConfig::new(server_ip, server_port);
            if let Err(e) = server.save(&self.config.data_dir) {
                warn!("Failed to save server config: {}", e);
            }
            *self.server_config.lock().await = Some(server);
        }

        DaemonResponse::AutoConnect {
            success: result.is_ok(),
            messages: session.messages(),
            dismissed: session.dismissed(),
        }
    }

    async fn handle_disconnect(&self) -> DaemonResponse {
        let Some(server) = self.server_config.lock().await.clone() else {
            return DaemonResponse::Error("No auto connection server recorded".to_string());
        };

        let name = self.auto_connect.tunnel_name();
        if let Some(tunnel) = self.manager.get(name).await {
            if tunnel.state == TunnelState::Up {
                if let Err(e) = self.manager.set_state(name, TunnelState::Down).await {
                    warn!("Failed to bring {} down: {}", name, e);
                }
            }
        }

        let message = match self
            .backend
            .release(&server.server_ip, &server.server_port)
            .await
        {
            Ok(()) => format!("Released auto connection at {}", server.address()),
            Err(BackendError::NotConnected(_)) => {
                // No key survived, so the server cannot be told anything
                warn!("No key held for {}, forgetting it", server.address());
                format!("Nothing to release at {}, server forgotten", server.address())
            }
            Err(e) => {
                error!("Failed to release auto connection at {}: {}", server.address(), e);
                return DaemonResponse::Error(format!(
                    "Failed to release auto connection at {}: {}",
                    server.address(),
                    e
                ));
            }
        };

        if let Err(e) = ServerConfig::delete(&self.config.data_dir) {
            warn!("Failed to remove server config: {}", e);
        }
        *self.server_config.lock().await = None;

        DaemonResponse::Ok(Some(message))
    }

    async fn handle_list(&self) -> DaemonResponse {
        let tunnels = self.manager.list().await;
        DaemonResponse::Tunnels(tunnels.into_iter().map(summarize).collect())
    }

    async fn handle_show(&self, name: &str) -> DaemonResponse {
        match self.manager.get(name).await {
            Some(tunnel) => DaemonResponse::TunnelConfig(tunnel.config.to_string()),
            None => DaemonResponse::Error(format!("Tunnel {} not found", name)),
        }
    }

    async fn handle_set_state(&self, name: String, state: TunnelState) -> DaemonResponse {
        match self.manager.set_state(&name, state).await {
            Ok(state) => DaemonResponse::TunnelState { name, state },
            Err(e) => DaemonResponse::Error(format!("Failed to set {} {}: {}", name, state, e)),
        }
    }

    async fn handle_delete(&self, name: &str) -> DaemonResponse {
        let Some(tunnel) = self.manager.get(name).await else {
            return DaemonResponse::Error(format!("Tunnel {} not found", name));
        };
        match self.manager.delete(tunnel.id).await {
            Ok(()) => DaemonResponse::Ok(Some(format!("Deleted tunnel {}", name))),
            Err(e) => DaemonResponse::Error(format!("Failed to delete {}: {}", name, e)),
        }
    }

    async fn handle_get_server(&self) -> DaemonResponse {
        match self.server_config.lock().await.as_ref() {
            Some(config) => DaemonResponse::ServerConfig {
                server_ip: config.server_ip.clone(),
                server_port: config.server_port.clone(),
            },
            None => DaemonResponse::Error("Server not configured".to_string()),
        }
    }

    async fn handle_get_config(&self) -> DaemonResponse {
        match serde_json::to_value(&self.config) {
            Ok(value) => DaemonResponse::Config(value),
            Err(e) => DaemonResponse::Error(format!("Failed to serialize config: {}", e)),
        }
    }

    /// Get the shared secret value
    pub fn get_secret(&self) -> &str {
        self.secret.value()
    }

    /// Get the daemon socket path
    pub fn get_socket_path(&self) -> &Path {
        &self.config.daemon_socket
    }

    /// Start the daemon's Unix socket server
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let socket = self.get_socket_path();
        if socket.exists() {
            std::fs::remove_file(socket)?;
        }
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket)?;
        info!("Listening on socket: {:?}", socket);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let daemon = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, daemon).await {
                            error!("Error handling client: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Serve one request on a client connection
async fn handle_client(mut stream: UnixStream, daemon: Arc<Daemon>) -> io::Result<()> {
    let message: IpcMessage = read_frame(&mut stream).await?;
    debug!("Request: {:?}", message.request);

    let response = daemon
        .handle_request_until(message.request, &message.secret, peer_closed(&mut stream))
        .await;
    write_frame(&mut stream, &response).await
}

/// Resolves once the client closes its end of the connection
async fn peer_closed(stream: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoconnect::{MSG_ALREADY_EXISTS, MSG_FAILED, MSG_STARTED};
    use crate::backend::testing::{MockBackend, sample_config};
    use super::client::DaemonClient;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> ClientConfig {
        ClientConfig {
            data_dir: temp_dir.path().to_path_buf(),
            daemon_socket: temp_dir.path().join("daemon.sock"),
            ..Default::default()
        }
    }

    async fn daemon(temp_dir: &TempDir, backend: Arc<MockBackend>) -> Daemon {
        Daemon::with_backend(test_config(temp_dir), backend).await.unwrap()
    }

    async fn connect(daemon: &Daemon) -> DaemonResponse {
        let req = DaemonRequest::AutoConnect {
            server_ip: "203.0.113.5".to_string(),
            server_port: "51820".to_string(),
        };
        daemon.handle_request(req, daemon.get_secret()).await
    }

    #[tokio::test]
    async fn test_daemon_creation() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = daemon(&temp_dir, Arc::new(MockBackend::returning(None))).await;

        match daemon.handle_request(DaemonRequest::Status, daemon.get_secret()).await {
            DaemonResponse::Status {
                running,
                tunnels,
                server,
                ..
            } => {
                assert!(running);
                assert_eq!(tunnels, 0);
                assert!(server.is_none());
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = daemon(&temp_dir, Arc::new(MockBackend::returning(None))).await;

        match daemon.handle_request(DaemonRequest::Status, "wrong-secret").await {
            DaemonResponse::Error(msg) => assert!(msg.contains("Authentication")),
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auto_connect_registers_and_records_server() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::returning(Some(sample_config())));
        let daemon = daemon(&temp_dir, backend.clone()).await;

        match connect(&daemon).await {
            DaemonResponse::AutoConnect {
                success,
                messages,
                dismissed,
            } => {
                assert!(success);
                assert_eq!(messages, vec![MSG_STARTED]);
                assert!(dismissed);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
        assert_eq!(
            ServerConfig::load(temp_dir.path()).unwrap().address(),
            "203.0.113.5:51820"
        );

        match daemon.handle_request(DaemonRequest::ListTunnels, daemon.get_secret()).await {
            DaemonResponse::Tunnels(tunnels) => {
                assert_eq!(
                    tunnels,
                    vec![TunnelSummary {
                        name: "wg0".to_string(),
                        state: TunnelState::Down,
                        addresses: vec!["10.1.1.100/32".to_string()],
                        endpoint: Some("203.0.113.5:51820".to_string()),
                    }]
                );
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        // wg0 now exists, so a second attempt stops before the backend
        match connect(&daemon).await {
            DaemonResponse::AutoConnect {
                success, messages, ..
            } => {
                assert!(!success);
                assert_eq!(messages, vec![MSG_ALREADY_EXISTS]);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
        assert_eq!(backend.ac_calls(), 1);
    }

    #[tokio::test]
    async fn test_auto_connect_failure() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = daemon(&temp_dir, Arc::new(MockBackend::returning(None))).await;

        match connect(&daemon).await {
            DaemonResponse::AutoConnect {
                success,
                messages,
                dismissed,
            } => {
                assert!(!success);
                assert_eq!(messages, vec![MSG_FAILED]);
                assert!(!dismissed);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
        assert!(matches!(
            daemon.handle_request(DaemonRequest::GetServer, daemon.get_secret()).await,
            DaemonResponse::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_tunnel_requests() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = daemon(&temp_dir, Arc::new(MockBackend::returning(Some(sample_config())))).await;
        let secret = daemon.get_secret().to_string();
        connect(&daemon).await;

        let req = DaemonRequest::SetTunnelState {
            name: "wg0".to_string(),
            state: TunnelState::Toggle,
        };
        assert!(matches!(
            daemon.handle_request(req, &secret).await,
            DaemonResponse::TunnelState { state: TunnelState::Up, .. }
        ));

        match daemon
            .handle_request(DaemonRequest::ShowTunnel { name: "wg0".to_string() }, &secret)
            .await
        {
            DaemonResponse::TunnelConfig(text) => {
                assert!(text.starts_with("[Interface]"));
                assert!(text.contains("Endpoint = 203.0.113.5:51820"));
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        let delete = DaemonRequest::DeleteTunnel { name: "wg0".to_string() };
        assert!(matches!(
            daemon.handle_request(delete.clone(), &secret).await,
            DaemonResponse::Ok(_)
        ));
        assert!(matches!(
            daemon.handle_request(delete, &secret).await,
            DaemonResponse::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_brings_tunnel_down() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::returning(Some(sample_config())));
        let daemon = daemon(&temp_dir, backend.clone()).await;
        let secret = daemon.get_secret().to_string();

        assert!(matches!(
            daemon.handle_request(DaemonRequest::Disconnect, &secret).await,
            DaemonResponse::Error(_)
        ));

        connect(&daemon).await;
        let up = DaemonRequest::SetTunnelState {
            name: "wg0".to_string(),
            state: TunnelState::Up,
        };
        daemon.handle_request(up, &secret).await;

        assert!(matches!(
            daemon.handle_request(DaemonRequest::Disconnect, &secret).await,
            DaemonResponse::Ok(_)
        ));
        assert_eq!(backend.ac_calls(), 2);
        assert_eq!(
            backend.state_calls().last(),
            Some(&("wg0".to_string(), TunnelState::Down))
        );
        assert!(ServerConfig::load(temp_dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_server_when_release_fails() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::returning(Some(sample_config())).failing_release());
        let daemon = daemon(&temp_dir, backend.clone()).await;
        let secret = daemon.get_secret().to_string();
        connect(&daemon).await;

        match daemon.handle_request(DaemonRequest::Disconnect, &secret).await {
            DaemonResponse::Error(msg) => assert!(msg.contains("203.0.113.5:51820")),
            other => panic!("Expected error response, got {:?}", other),
        }
        assert!(ServerConfig::load(temp_dir.path()).is_ok());
        assert!(matches!(
            daemon.handle_request(DaemonRequest::GetServer, &secret).await,
            DaemonResponse::ServerConfig { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_from_unreachable_server_after_restart() {
        let temp_dir = TempDir::new().unwrap();

        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let mut config = test_config(&temp_dir);
        config.auto_connect.attempts = 1;
        config.auto_connect.retry_delay_secs = 0;
        config.auto_connect.connect_timeout_secs = 1;
        std::fs::create_dir_all(config.tunnels_dir()).unwrap();
        std::fs::write(
            config.tunnels_dir().join("wg0.conf"),
            sample_config().to_string(),
        )
        .unwrap();
        ServerConfig::new("127.0.0.1".to_string(), port)
            .save(temp_dir.path())
            .unwrap();

        let daemon = Daemon::new(config).await.unwrap();
        let secret = daemon.get_secret().to_string();

        for _ in 0..2 {
            match daemon.handle_request(DaemonRequest::Disconnect, &secret).await {
                DaemonResponse::Error(msg) => assert!(msg.contains("Failed to release")),
                other => panic!("Expected error response, got {:?}", other),
            }
            assert!(ServerConfig::load(temp_dir.path()).is_ok());
        }
    }

    #[tokio::test]
    async fn test_client_hangup_cancels_auto_connect() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(
            MockBackend::returning(Some(sample_config())).with_delay(Duration::from_millis(300)),
        );
        let daemon = Arc::new(daemon(&temp_dir, backend.clone()).await);
        let socket = daemon.get_socket_path().to_path_buf();

        let server = tokio::spawn(daemon.clone().run());
        while !socket.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let message = IpcMessage {
            secret: daemon.get_secret().to_string(),
            request: DaemonRequest::AutoConnect {
                server_ip: "203.0.113.5".to_string(),
                server_port: "51820".to_string(),
            },
        };
        write_frame(&mut stream, &message).await.unwrap();
        while backend.ac_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(stream);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(daemon.manager.list().await.is_empty());
        assert!(ServerConfig::load(temp_dir.path()).is_err());

        server.abort();
    }

    #[tokio::test]
    async fn test_requests_over_socket() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = Arc::new(daemon(&temp_dir, Arc::new(MockBackend::returning(None))).await);
        let socket = daemon.get_socket_path().to_path_buf();

        let server = tokio::spawn(daemon.clone().run());
        while !socket.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let client = DaemonClient::new(&socket, temp_dir.path()).unwrap();
        let response = client.send_request(DaemonRequest::Status).await.unwrap();
        assert!(matches!(response, DaemonResponse::Status { running: true, .. }));

        server.abort();
    }
}
