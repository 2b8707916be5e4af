//! Core error types

use thiserror::Error;

/// Core error type for TrustDAG
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is missing or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Hash could not be decoded
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
