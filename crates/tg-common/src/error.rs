//! Error types for throttle-guard.
//!
//! Every error carries a stable numeric code and a category so the CLI can
//! map it to an exit code and the health surface can group it:
//! - 10-19: configuration
//! - 20-29: process control
//! - 30-39: policy ledger
//! - 40-49: engine lifecycle
//! - 60-69: I/O and serialization
//! - 70-79: platform

use crate::names::NameError;
use crate::os_error::OsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for throttle-guard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Process,
    Ledger,
    Engine,
    Io,
    Platform,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Process => write!(f, "process"),
            ErrorCategory::Ledger => write!(f, "ledger"),
            ErrorCategory::Engine => write!(f, "engine"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Platform => write!(f, "platform"),
        }
    }
}

/// Unified error type for throttle-guard.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid target name: {0}")]
    InvalidName(#[from] NameError),

    // Process control errors (20-29)
    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("access denied to process {pid}")]
    AccessDenied { pid: u32 },

    #[error("process {pid}: {source}")]
    ProcessControl {
        pid: u32,
        #[source]
        source: OsError,
    },

    // Ledger errors (30-39)
    #[error("policy ledger error: {0}")]
    Ledger(String),

    // Engine lifecycle errors (40-49)
    #[error("engine error: {0}")]
    Engine(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Platform errors (70-79)
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("OS call failed: {0}")]
    Os(#[from] OsError),
}

impl Error {
    /// Stable error code.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidName(_) => 11,
            Error::ProcessNotFound { .. } => 20,
            Error::AccessDenied { .. } => 21,
            Error::ProcessControl { .. } => 22,
            Error::Ledger(_) => 30,
            Error::Engine(_) => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::UnsupportedPlatform(_) => 70,
            Error::Os(_) => 71,
        }
    }

    /// Category for grouping.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidName(_) => ErrorCategory::Config,
            Error::ProcessNotFound { .. }
            | Error::AccessDenied { .. }
            | Error::ProcessControl { .. } => ErrorCategory::Process,
            Error::Ledger(_) => ErrorCategory::Ledger,
            Error::Engine(_) => ErrorCategory::Engine,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
            Error::UnsupportedPlatform(_) | Error::Os(_) => ErrorCategory::Platform,
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ProcessNotFound { .. } => false,
            Error::UnsupportedPlatform(_) => false,
            Error::InvalidName(_) => false,
            Error::ProcessControl { source, .. } => !source.indicates_process_gone(),
            _ => true,
        }
    }
}
