use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{ConfigStore, StoreError};
use super::{Tunnel, TunnelConfig, TunnelId, TunnelState, is_name_invalid};
use crate::backend::{Backend, BackendError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid tunnel name: {0:?}")]
    InvalidName(String),

    #[error("tunnel {0} already exists")]
    AlreadyExists(String),

    #[error("tunnel {0} not found")]
    NotFound(String),

    #[error("tunnel {0} is no longer registered")]
    UnknownTunnel(TunnelId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Registry of named tunnels.
///
/// Every operation that reads and then mutates the registry does so under a
/// single lock, so concurrent callers never observe or create duplicates.
pub struct TunnelManager {
    tunnels: Mutex<HashMap<String, Tunnel>>,
    next_id: AtomicU64,
    store: Box<dyn ConfigStore>,
    backend: Arc<dyn Backend>,
}

fn find_name(tunnels: &HashMap<String, Tunnel>, id: TunnelId) -> Option<String> {
    tunnels
        .values()
        .find(|t| t.id == id)
        .map(|t| t.name.clone())
}

impl TunnelManager {
    pub fn new(store: Box<dyn ConfigStore>, backend: Arc<dyn Backend>) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store,
            backend,
        }
    }

    fn allocate_id(&self) -> TunnelId {
        TunnelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Populate the registry from the config store. Tunnels start down.
    pub async fn load(&self) -> Result<usize, ManagerError> {
        let names = self.store.enumerate()?;
        let mut tunnels = self.tunnels.lock().await;

        for name in names {
            if tunnels.contains_key(&name) {
                continue;
            }
            if is_name_invalid(&name) {
                warn!("Skipping stored tunnel with invalid name {:?}", name);
                continue;
            }
            match self.store.load(&name) {
                Ok(config) => {
                    debug!("Loaded tunnel {}", name);
                    let tunnel = Tunnel {
                        id: self.allocate_id(),
                        name: name.clone(),
                        config,
                        state: TunnelState::Down,
                    };
                    tunnels.insert(name, tunnel);
                }
                Err(e) => warn!("Failed to load tunnel {}: {}", name, e),
            }
        }

        Ok(tunnels.len())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tunnels.lock().await.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<Tunnel> {
        self.tunnels.lock().await.get(name).cloned()
    }

    /// All tunnels, ordered by name
    pub async fn list(&self) -> Vec<Tunnel> {
        let mut list: Vec<Tunnel> = self.tunnels.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn create(&self, name: &str, config: TunnelConfig) -> Result<Tunnel, ManagerError> {
        if is_name_invalid(name) {
            return Err(ManagerError::InvalidName(name.to_string()));
        }

        let mut tunnels = self.tunnels.lock().await;
        if tunnels.contains_key(name) {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }

        self.store.create(name, &config)?;
        let tunnel = Tunnel {
            id: self.allocate_id(),
            name: name.to_string(),
            config,
            state: TunnelState::Down,
        };
        tunnels.insert(name.to_string(), tunnel.clone());
        info!("Created tunnel {} ({})", name, tunnel.id);
        Ok(tunnel)
    }

    /// Remove a tunnel, bringing its device down first if it is up.
    pub async fn delete(&self, id: TunnelId) -> Result<(), ManagerError> {
        let mut tunnels = self.tunnels.lock().await;
        let name = find_name(&tunnels, id).ok_or(ManagerError::UnknownTunnel(id))?;

        if let Some(tunnel) = tunnels.get_mut(&name) {
            if tunnel.state == TunnelState::Up {
                tunnel.state = TunnelState::Down;
                let snapshot = tunnel.clone();
                if let Err(e) = self.backend.set_state(&snapshot, TunnelState::Down).await {
                    warn!("Failed to bring {} down before deletion: {}", name, e);
                }
            }
        }

        match self.store.delete(&name) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        tunnels.remove(&name);
        info!("Deleted tunnel {} ({})", name, id);
        Ok(())
    }

    /// Drop `previous` (if still registered) and create `name` as one step.
    ///
    /// `name` may only be taken by `previous` itself. The only await point is
    /// bringing an up `previous` down. Its state is recorded as down before
    /// that, and the store and map are only changed after it.
    pub async fn replace(
        &self,
        previous: Option<TunnelId>,
        name: &str,
        config: TunnelConfig,
    ) -> Result<Tunnel, ManagerError> {
        if is_name_invalid(name) {
            return Err(ManagerError::InvalidName(name.to_string()));
        }

        let mut tunnels = self.tunnels.lock().await;
        let previous_name = previous.and_then(|id| find_name(&tunnels, id));

        if let Some(existing) = tunnels.get(name) {
            if Some(existing.id) != previous {
                return Err(ManagerError::AlreadyExists(name.to_string()));
            }
        }

        if let Some(prev) = previous_name.as_ref().and_then(|n| tunnels.get_mut(n)) {
            if prev.state == TunnelState::Up {
                // Recorded first so an abort at the await cannot leave it marked up
                prev.state = TunnelState::Down;
                let snapshot = prev.clone();
                if let Err(e) = self.backend.set_state(&snapshot, TunnelState::Down).await {
                    warn!("Failed to bring {} down before replacement: {}", snapshot.name, e);
                }
            }
        }

        match previous_name.as_deref() {
            Some(prev) if prev == name => self.store.save(name, &config)?,
            Some(prev) => {
                self.store.create(name, &config)?;
                if let Err(e) = self.store.delete(prev) {
                    warn!("Failed to remove stored config of {}: {}", prev, e);
                }
            }
            None => self.store.create(name, &config)?,
        }

        if let Some(prev) = previous_name {
            if let Some(old) = tunnels.remove(&prev) {
                info!("Deleted tunnel {} ({})", old.name, old.id);
            }
        }

        let tunnel = Tunnel {
            id: self.allocate_id(),
            name: name.to_string(),
            config,
            state: TunnelState::Down,
        };
        tunnels.insert(name.to_string(), tunnel.clone());
        info!("Created tunnel {} ({})", name, tunnel.id);
        Ok(tunnel)
    }

    pub async fn set_config(&self, id: TunnelId, config: TunnelConfig) -> Result<(), ManagerError> {
        let mut tunnels = self.tunnels.lock().await;
        let name = find_name(&tunnels, id).ok_or(ManagerError::UnknownTunnel(id))?;

        self.store.save(&name, &config)?;
        if let Some(tunnel) = tunnels.get_mut(&name) {
            tunnel.config = config;
        }
        Ok(())
    }

    pub async fn set_name(&self, id: TunnelId, new_name: &str) -> Result<(), ManagerError> {
        if is_name_invalid(new_name) {
            return Err(ManagerError::InvalidName(new_name.to_string()));
        }

        let mut tunnels = self.tunnels.lock().await;
        let name = find_name(&tunnels, id).ok_or(ManagerError::UnknownTunnel(id))?;
        if name == new_name {
            return Ok(());
        }
        if tunnels.contains_key(new_name) {
            return Err(ManagerError::AlreadyExists(new_name.to_string()));
        }

        self.store.rename(&name, new_name)?;
        if let Some(mut tunnel) = tunnels.remove(&name) {
            tunnel.name = new_name.to_string();
            tunnels.insert(new_name.to_string(), tunnel);
        }
        info!("Renamed tunnel {} to {}", name, new_name);
        Ok(())
    }

    /// Move a tunnel to `state` through the backend and record the outcome.
    pub async fn set_state(&self, name: &str, state: TunnelState) -> Result<TunnelState, ManagerError> {
        let mut tunnels = self.tunnels.lock().await;
        let tunnel = tunnels
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        let target = state.resolve(tunnel.state);
        if target == tunnel.state {
            return Ok(target);
        }

        let reached = self.backend.set_state(tunnel, target).await?;
        tunnel.state = reached;
        info!("Tunnel {} is {}", name, reached);
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{MockBackend, sample_config};
    use crate::tunnel::FileConfigStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, backend: Arc<MockBackend>) -> TunnelManager {
        TunnelManager::new(Box::new(FileConfigStore::new(dir.path())), backend)
    }

    #[tokio::test]
    async fn test_create_persists_and_rejects_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));

        let config = sample_config();
        let tunnel = mgr.create("wg0", config.clone()).await.unwrap();
        assert_eq!(tunnel.name, "wg0");
        assert_eq!(tunnel.state, TunnelState::Down);
        assert!(mgr.contains("wg0").await);
        assert!(temp_dir.path().join("wg0.conf").exists());

        assert!(matches!(
            mgr.create("wg0", config.clone()).await,
            Err(ManagerError::AlreadyExists(_))
        ));
        assert!(matches!(
            mgr.create("bad name", config).await,
            Err(ManagerError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = sample_config();
        {
            let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));
            mgr.create("wg0", config.clone()).await.unwrap();
            mgr.create("home", sample_config()).await.unwrap();
        }

        let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));
        assert_eq!(mgr.load().await.unwrap(), 2);
        let names: Vec<String> = mgr.list().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["home", "wg0"]);
        assert_eq!(mgr.get("wg0").await.unwrap().config, config);
    }

    #[tokio::test]
    async fn test_rename_keeps_identity() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));

        let tunnel = mgr.create("wg0", sample_config()).await.unwrap();
        mgr.set_name(tunnel.id, "office").await.unwrap();

        assert!(!mgr.contains("wg0").await);
        assert_eq!(mgr.get("office").await.unwrap().id, tunnel.id);
        assert!(temp_dir.path().join("office.conf").exists());
        assert!(!temp_dir.path().join("wg0.conf").exists());
    }

    #[tokio::test]
    async fn test_set_config_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));

        let tunnel = mgr.create("wg0", sample_config()).await.unwrap();
        let replacement = sample_config();
        mgr.set_config(tunnel.id, replacement.clone()).await.unwrap();
        assert_eq!(mgr.get("wg0").await.unwrap().config, replacement);

        mgr.delete(tunnel.id).await.unwrap();
        assert!(mgr.list().await.is_empty());
        assert!(matches!(
            mgr.delete(tunnel.id).await,
            Err(ManagerError::UnknownTunnel(_))
        ));
    }

    #[tokio::test]
    async fn test_state_changes_go_through_backend() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::returning(None));
        let mgr = manager(&temp_dir, backend.clone());

        let tunnel = mgr.create("wg0", sample_config()).await.unwrap();
        assert_eq!(mgr.set_state("wg0", TunnelState::Toggle).await.unwrap(), TunnelState::Up);
        // Already up, no backend call
        assert_eq!(mgr.set_state("wg0", TunnelState::Up).await.unwrap(), TunnelState::Up);

        mgr.delete(tunnel.id).await.unwrap();
        assert_eq!(
            backend.state_calls(),
            vec![
                ("wg0".to_string(), TunnelState::Up),
                ("wg0".to_string(), TunnelState::Down),
            ]
        );
        assert!(matches!(
            mgr.set_state("wg0", TunnelState::Up).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_requires_ownership_of_name() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));

        let foreign = mgr.create("wg0", sample_config()).await.unwrap();
        assert!(matches!(
            mgr.replace(None, "wg0", sample_config()).await,
            Err(ManagerError::AlreadyExists(_))
        ));

        let config = sample_config();
        let replaced = mgr.replace(Some(foreign.id), "wg0", config.clone()).await.unwrap();
        assert_ne!(replaced.id, foreign.id);
        assert_eq!(mgr.list().await.len(), 1);
        assert_eq!(mgr.get("wg0").await.unwrap().config, config);
    }

    #[tokio::test]
    async fn test_replace_removes_renamed_previous() {
        let temp_dir = TempDir::new().unwrap();
        let mgr = manager(&temp_dir, Arc::new(MockBackend::returning(None)));

        let first = mgr.create("wg0", sample_config()).await.unwrap();
        mgr.set_name(first.id, "moved").await.unwrap();

        mgr.replace(Some(first.id), "wg0", sample_config()).await.unwrap();
        let names: Vec<String> = mgr.list().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["wg0"]);
        assert!(!temp_dir.path().join("moved.conf").exists());
    }

    #[tokio::test]
    async fn test_abort_while_replacing_up_tunnel() {
        let temp_dir = TempDir::new().unwrap();
        let backend =
            Arc::new(MockBackend::returning(None).with_state_delay(Duration::from_millis(200)));
        let mgr = Arc::new(manager(&temp_dir, backend.clone()));

        let first = mgr.create("wg0", sample_config()).await.unwrap();
        mgr.set_state("wg0", TunnelState::Up).await.unwrap();

        let replacing = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.replace(Some(first.id), "wg0", sample_config()).await })
        };
        while backend.state_calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        replacing.abort();
        assert!(replacing.await.unwrap_err().is_cancelled());

        let tunnel = mgr.get("wg0").await.unwrap();
        assert_eq!(tunnel.id, first.id);
        assert_eq!(tunnel.state, TunnelState::Down);
    }
}
