// src/config.rs

//! Runtime configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment overrides, then whatever the CLI passes explicitly. Catalog
//! state (repositories, preferences, installed apps) lives in the database,
//! never here.

use crate::compat::DeviceProfile;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Default location of the catalog database
pub const DEFAULT_DB_PATH: &str = "/var/lib/appcatalog/catalog.db";

/// Number of index entries buffered before a flush to staging
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Environment variable overriding `db_path`
pub const DB_PATH_ENV: &str = "APPCATALOG_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    pub log_level: String,
    pub sync: SyncConfig,
    pub device: DeviceProfile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            log_level: "info".to_string(),
            sync: SyncConfig::default(),
            device: DeviceProfile::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Entries per staging flush
    pub batch_size: usize,
    /// Suggest versions newer than the upstream stable version code
    pub unstable_updates: bool,
    /// Release channel used when a package has no channel preference of its own
    pub default_release_channel: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            unstable_updates: false,
            default_release_channel: "Stable".to_string(),
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path` if given, defaults otherwise
    ///
    /// Environment overrides are applied last in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                let contents = fs::read_to_string(path).map_err(|e| {
                    Error::InitError(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = std::env::var(DB_PATH_ENV)
            && !db_path.trim().is_empty()
        {
            self.db_path = db_path;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 {
            return Err(Error::InitError(
                "sync.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
