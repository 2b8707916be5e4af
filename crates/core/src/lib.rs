//! Core functionality for the TrustDAG node.
//!
//! This crate provides the content hash used to address transactions and
//! payloads, the node configuration, logging initialization and the shared
//! error type.

pub mod config;
pub mod error;
pub mod hash;
pub mod logging;
pub mod time;

pub use config::{
    Config, EventsConfig, LogFormat, LoggingConfig, NodeConfig, SigningConfig, StorageConfig,
    StorageEngineKind,
};
pub use error::{CoreError, Result};
pub use hash::{Hash, HASH_SIZE};
