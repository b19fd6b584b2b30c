//! Configuration persistence.
//!
//! Storage hands the reconciler immutable config snapshots and makes
//! auto-assigned service addresses durable across restarts.

use crate::config::{validate_config, Config};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading or saving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write configuration file: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("no configuration loaded")]
    NotLoaded,
}

/// Contract the core consumes configuration through.
pub trait ConfigStorage: Send + Sync {
    /// Return the current configuration snapshot.
    fn get_config(&self) -> Result<Config, ConfigError>;

    /// Persist the given configuration.
    fn save_config(&self, config: &Config) -> Result<(), ConfigError>;
}

/// In-memory configuration storage.
///
/// Used by tests and as the cache layer of [`FileStorage`].
pub struct MemoryStorage {
    config: RwLock<Option<Config>>,
}

impl MemoryStorage {
    /// Create storage holding the given configuration, if any.
    pub fn new(config: Option<Config>) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

impl ConfigStorage for MemoryStorage {
    fn get_config(&self) -> Result<Config, ConfigError> {
        self.config.read().clone().ok_or(ConfigError::NotLoaded)
    }

    fn save_config(&self, config: &Config) -> Result<(), ConfigError> {
        *self.config.write() = Some(config.clone());
        Ok(())
    }
}

/// File-backed configuration storage.
///
/// Reads the JSON file once and serves subsequent reads from memory;
/// saves write through to both.
pub struct FileStorage {
    path: PathBuf,
    cache: MemoryStorage,
}

impl FileStorage {
    /// Create storage backed by the given file path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: MemoryStorage::new(None),
        }
    }

    fn load_from_file(&self) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(&self.path).map_err(ConfigError::Read)?;
        let config: Config = serde_json::from_str(&contents)?;
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

impl ConfigStorage for FileStorage {
    fn get_config(&self) -> Result<Config, ConfigError> {
        if let Ok(config) = self.cache.get_config() {
            return Ok(config);
        }

        let config = self.load_from_file()?;
        self.cache.save_config(&config)?;
        Ok(config)
    }

    fn save_config(&self, config: &Config) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, data).map_err(ConfigError::Write)?;
        self.cache.save_config(config)
    }
}
