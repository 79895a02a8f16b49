//! Configuration errors.

use std::path::PathBuf;
use tg_common::NameError;
use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading, validating, or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("I/O error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Invalid JSON in legacy config {path}: {source}")]
    Legacy {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid target: {0}")]
    InvalidName(#[from] NameError),

    #[error("Target already configured: {0}")]
    DuplicateTarget(String),

    #[error("Target not configured: {0}")]
    UnknownTarget(String),
}

impl ConfigError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ConfigError::NotFound { .. } => 10,
            ConfigError::Read { .. } => 60,
            ConfigError::Write { .. } => 62,
            ConfigError::TooLarge { .. } => 12,
            ConfigError::Legacy { .. } => 13,
            ConfigError::InvalidName(_) => 11,
            ConfigError::DuplicateTarget(_) => 14,
            ConfigError::UnknownTarget(_) => 15,
        }
    }
}

impl From<ConfigError> for tg_common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidName(name) => tg_common::Error::InvalidName(name),
            other => tg_common::Error::Config(other.to_string()),
        }
    }
}
