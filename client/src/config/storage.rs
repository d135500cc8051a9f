//! Config file persistence

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use super::types::ClientConfig;

const APP_DIR: &str = "perssh";
const CONFIG_FILE: &str = "client.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine the user config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// `<config dir>/perssh`
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or(StorageError::NoConfigDir)
}

/// `<config dir>/perssh/client.json`
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Reads and writes one config file.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage at the default location.
    pub fn default_location() -> Result<Self, StorageError> {
        Ok(Self::new(config_file()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, writing defaults first if the file does not exist.
    pub fn load_or_create(&self) -> Result<ClientConfig, StorageError> {
        if !self.path.exists() {
            info!("Creating default config at {:?}", self.path);
            let config = ClientConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let config = serde_json::from_str(&content)?;
        debug!("Loaded config from {:?}", self.path);
        Ok(config)
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, config: &ClientConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(config)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_load_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::new(dir.path().join("nested").join("client.json"));

        let config = storage.load_or_create().unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(storage.path().exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::new(dir.path().join("client.json"));

        let mut config = ClientConfig::default();
        config.remember_login("192.168.1.20", "ops", 2200);
        config.agent.auto_deploy = false;
        storage.save(&config).unwrap();

        let loaded = storage.load_or_create().unwrap();
        assert_eq!(loaded.session.last_host.as_deref(), Some("192.168.1.20"));
        assert_eq!(loaded.session.last_port, 2200);
        assert!(!loaded.agent.auto_deploy);
        assert!(!dir.path().join("client.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            ConfigStorage::new(path).load_or_create(),
            Err(StorageError::Json(_))
        ));
    }
}
