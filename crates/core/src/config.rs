//! Configuration management for TrustDAG.
//!
//! Configuration is read from a TOML file. Every section and every field has
//! a default, so an empty file is a valid configuration. A few values can be
//! overridden from the environment, which wins over the file.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `node.datadir`.
pub const ENV_DATADIR: &str = "TRUSTDAG_DATADIR";
/// Overrides `node.node_id`.
pub const ENV_NODE_ID: &str = "TRUSTDAG_NODE_ID";

/// File name of the DAG database inside the data directory.
pub const DEFAULT_DATABASE_FILE: &str = "dag.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub events: EventsConfig,
    pub signing: SigningConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub datadir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-001".to_string(),
            datadir: PathBuf::from("./data"),
        }
    }
}

/// Which key-value engine backs the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngineKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: StorageEngineKind,
    /// Database file; defaults to `<datadir>/dag.db`
    pub path: Option<PathBuf>,
    /// Number of clock index entries loaded per walk page
    pub walk_page_size: usize,
    /// Idle read connections kept open by the SQLite engine
    pub reader_pool_size: usize,
    pub busy_timeout_ms: u64,
    /// Run the store integrity check when opening
    pub verify_on_open: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngineKind::Sqlite,
            path: None,
            walk_page_size: 256,
            reader_pool_size: 4,
            busy_timeout_ms: 5_000,
            verify_on_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Attempts per subscriber before a delivery is given up
    pub max_delivery_attempts: u32,
    /// Delay before retry n is n times this value
    pub retry_backoff_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SigningConfig {
    /// Embed the public key in signed transactions instead of a key ID
    pub embed_public_key: bool,
    /// Upper bound on a single key resolution during verification
    pub key_resolution_timeout_ms: u64,
    /// Threads resolving key IDs; lookups beyond these plus a short queue fail fast
    pub key_resolution_workers: usize,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            embed_public_key: false,
            key_resolution_timeout_ms: 2_000,
            key_resolution_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Loads a configuration file and applies environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from TOML text without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(datadir) = std::env::var(ENV_DATADIR) {
            if !datadir.is_empty() {
                self.node.datadir = PathBuf::from(datadir);
            }
        }
        if let Ok(node_id) = std::env::var(ENV_NODE_ID) {
            if !node_id.is_empty() {
                self.node.node_id = node_id;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(CoreError::Config("node.node_id must not be empty".to_string()));
        }
        if self.storage.walk_page_size == 0 {
            return Err(CoreError::Config(
                "storage.walk_page_size must be at least 1".to_string(),
            ));
        }
        if self.events.max_delivery_attempts == 0 {
            return Err(CoreError::Config(
                "events.max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        if self.signing.key_resolution_timeout_ms == 0 {
            return Err(CoreError::Config(
                "signing.key_resolution_timeout_ms must be positive".to_string(),
            ));
        }
        if self.signing.key_resolution_workers == 0 {
            return Err(CoreError::Config(
                "signing.key_resolution_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Location of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.node.datadir.join(DEFAULT_DATABASE_FILE))
    }

    /// Creates the data directory if it does not exist yet.
    pub fn ensure_datadir(&self) -> Result<()> {
        if self.node.datadir.exists() && !self.node.datadir.is_dir() {
            return Err(CoreError::Config(format!(
                "datadir {} is not a directory",
                self.node.datadir.display()
            )));
        }
        std::fs::create_dir_all(&self.node.datadir)?;
        Ok(())
    }
}
