use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::config::{ConfigError, TunnelConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration for tunnel {0} already exists")]
    AlreadyExists(String),

    #[error("configuration for tunnel {0} not found")]
    NotFound(String),

    #[error("configuration for tunnel {name} is invalid: {source}")]
    Invalid {
        name: String,
        #[source]
        source: ConfigError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Persistent storage of tunnel configurations, keyed by tunnel name.
pub trait ConfigStore: Send + Sync {
    fn create(&self, name: &str, config: &TunnelConfig) -> Result<(), StoreError>;
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    fn enumerate(&self) -> Result<Vec<String>, StoreError>;
    fn load(&self, name: &str) -> Result<TunnelConfig, StoreError>;
    fn rename(&self, name: &str, replacement: &str) -> Result<(), StoreError>;
    fn save(&self, name: &str, config: &TunnelConfig) -> Result<(), StoreError>;
}

/// Stores each tunnel as `<dir>/<name>.conf` in the wg-quick format
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.conf", name))
    }

    fn write(&self, path: &Path, config: &TunnelConfig) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(path, config.to_string())?;
        // Private keys live in these files
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn create(&self, name: &str, config: &TunnelConfig) -> Result<(), StoreError> {
        let path = self.path_for(name);
        if path.exists() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        self.write(&path, config)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("conf") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, name: &str) -> Result<TunnelConfig, StoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let content = fs::read_to_string(path)?;
        TunnelConfig::parse(&content).map_err(|source| StoreError::Invalid {
            name: name.to_string(),
            source,
        })
    }

    fn rename(&self, name: &str, replacement: &str) -> Result<(), StoreError> {
        let from = self.path_for(name);
        let to = self.path_for(replacement);
        if !from.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if to.exists() {
            return Err(StoreError::AlreadyExists(replacement.to_string()));
        }
        fs::rename(from, to)?;
        Ok(())
    }

    fn save(&self, name: &str, config: &TunnelConfig) -> Result<(), StoreError> {
        let path = self.path_for(name);
        self.write(&path, config)
    }
}
