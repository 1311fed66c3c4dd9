use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::tunnel::{ManagerError, TunnelId, TunnelManager, TunnelState};

pub const MSG_ALREADY_EXISTS: &str =
    "You should try this after deleting the wg0 tunnel you set up earlier.";
pub const MSG_FAILED: &str = "Oops, Auto Connection is failed.";
pub const MSG_STARTED: &str = "OK, Auto Connection is started.";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("tunnel {0} already exists")]
    AlreadyExists(String),

    #[error("no configuration could be obtained from the server")]
    SynthesisFailed,

    #[error("failed to register tunnel: {0}")]
    Registry(ManagerError),
}

/// Shows short messages to the user
pub trait Notifier: Send + Sync {
    fn show_message(&self, text: &str);
}

/// The screen or session that started the procedure
pub trait Surface: Send + Sync {
    fn dismiss(&self);
}

/// The auto-connect procedure.
///
/// Obtains a configuration from an auto-configure server through the backend
/// and registers it as a single tunnel. The tunnel it created last is tracked
/// by identity, so a later success replaces it even if it was renamed.
pub struct AutoConnect {
    manager: Arc<TunnelManager>,
    backend: Arc<dyn Backend>,
    tunnel_name: String,
    owned: Mutex<Option<TunnelId>>,
}

impl AutoConnect {
    pub fn new(manager: Arc<TunnelManager>, backend: Arc<dyn Backend>, tunnel_name: String) -> Self {
        Self {
            manager,
            backend,
            tunnel_name,
            owned: Mutex::new(None),
        }
    }

    pub fn tunnel_name(&self) -> &str {
        &self.tunnel_name
    }

    /// Identity of the tunnel created by the last successful attempt
    pub async fn owned(&self) -> Option<TunnelId> {
        *self.owned.lock().await
    }

    pub async fn attempt(
        &self,
        server_ip: &str,
        server_port: &str,
        notifier: &dyn Notifier,
        surface: &dyn Surface,
    ) -> Result<(), ConnectError> {
        if self.manager.contains(&self.tunnel_name).await {
            warn!("Tunnel {} already exists, not contacting server", self.tunnel_name);
            notifier.show_message(MSG_ALREADY_EXISTS);
            return Err(ConnectError::AlreadyExists(self.tunnel_name.clone()));
        }

        info!("Requesting configuration from {}:{}", server_ip, server_port);
        let Some(config) = self
            .backend
            .set_ac(server_ip, server_port, TunnelState::Up)
            .await
        else {
            notifier.show_message(MSG_FAILED);
            return Err(ConnectError::SynthesisFailed);
        };

        // Nothing below awaits between the registry update and recording its result
        let mut owned = self.owned.lock().await;
        match self.manager.replace(*owned, &self.tunnel_name, config).await {
            Ok(tunnel) => {
                *owned = Some(tunnel.id);
                drop(owned);
                info!("Auto connection registered as {} ({})", tunnel.name, tunnel.id);
                notifier.show_message(MSG_STARTED);
                surface.dismiss();
                Ok(())
            }
            Err(ManagerError::AlreadyExists(name)) => {
                warn!("Tunnel {} was created concurrently", name);
                notifier.show_message(MSG_ALREADY_EXISTS);
                Err(ConnectError::AlreadyExists(name))
            }
            Err(e) => {
                warn!("Failed to register auto connection: {}", e);
                notifier.show_message(MSG_FAILED);
                Err(ConnectError::Registry(e))
            }
        }
    }

    /// Run [`AutoConnect::attempt`] on its own task. Aborting the handle while
    /// the server is being contacted leaves the registry as it was.
    pub fn launch(
        self: Arc<Self>,
        server_ip: String,
        server_port: String,
        notifier: Arc<dyn Notifier>,
        surface: Arc<dyn Surface>,
    ) -> JoinHandle<Result<(), ConnectError>> {
        tokio::spawn(async move {
            self.attempt(&server_ip, &server_port, notifier.as_ref(), surface.as_ref())
                .await
        })
    }
}
