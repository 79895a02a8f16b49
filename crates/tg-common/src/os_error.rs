//! Classified operating-system error codes.
//!
//! Platform calls report failures as a raw Win32 error code. The engine's
//! self-healing logic only cares about a handful of them, so the code is
//! carried as-is and classified on demand.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_PATH_NOT_FOUND: u32 = 3;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NOT_SUPPORTED: u32 = 50;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;
pub const ERROR_MORE_DATA: u32 = 234;

/// Coarse classification of an OS error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsErrorKind {
    AccessDenied,
    InvalidHandle,
    InvalidParameter,
    NotFound,
    Unsupported,
    Other,
}

/// A raw OS error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OsError {
    pub code: u32,
}

impl OsError {
    pub const fn new(code: u32) -> Self {
        Self { code }
    }

    pub const fn access_denied() -> Self {
        Self::new(ERROR_ACCESS_DENIED)
    }

    pub const fn invalid_handle() -> Self {
        Self::new(ERROR_INVALID_HANDLE)
    }

    pub const fn invalid_parameter() -> Self {
        Self::new(ERROR_INVALID_PARAMETER)
    }

    pub const fn not_found() -> Self {
        Self::new(ERROR_FILE_NOT_FOUND)
    }

    pub const fn unsupported() -> Self {
        Self::new(ERROR_NOT_SUPPORTED)
    }

    pub fn kind(&self) -> OsErrorKind {
        match self.code {
            ERROR_ACCESS_DENIED => OsErrorKind::AccessDenied,
            ERROR_INVALID_HANDLE => OsErrorKind::InvalidHandle,
            ERROR_INVALID_PARAMETER => OsErrorKind::InvalidParameter,
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => OsErrorKind::NotFound,
            ERROR_NOT_SUPPORTED | ERROR_CALL_NOT_IMPLEMENTED => OsErrorKind::Unsupported,
            _ => OsErrorKind::Other,
        }
    }

    /// The output buffer was filled but more data was available.
    pub fn is_more_data(&self) -> bool {
        self.code == ERROR_MORE_DATA
    }

    /// True when the code means the target object is gone rather than
    /// the call having failed transiently.
    pub fn indicates_process_gone(&self) -> bool {
        matches!(
            self.kind(),
            OsErrorKind::InvalidHandle | OsErrorKind::InvalidParameter
        )
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            OsErrorKind::AccessDenied => write!(f, "access denied (os error {})", self.code),
            OsErrorKind::InvalidHandle => write!(f, "invalid handle (os error {})", self.code),
            OsErrorKind::InvalidParameter => {
                write!(f, "invalid parameter (os error {})", self.code)
            }
            OsErrorKind::NotFound => write!(f, "not found (os error {})", self.code),
            OsErrorKind::Unsupported => write!(f, "not supported (os error {})", self.code),
            OsErrorKind::Other => write!(f, "os error {}", self.code),
        }
    }
}

impl std::error::Error for OsError {}

impl From<std::io::Error> for OsError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => OsError::new(code as u32),
            None => match err.kind() {
                std::io::ErrorKind::NotFound => OsError::not_found(),
                std::io::ErrorKind::PermissionDenied => OsError::access_denied(),
                std::io::ErrorKind::InvalidInput => OsError::invalid_parameter(),
                std::io::ErrorKind::Unsupported => OsError::unsupported(),
                _ => OsError::new(u32::MAX),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(OsError::new(5).kind(), OsErrorKind::AccessDenied);
        assert_eq!(OsError::new(6).kind(), OsErrorKind::InvalidHandle);
        assert_eq!(OsError::new(87).kind(), OsErrorKind::InvalidParameter);
        assert_eq!(OsError::new(2).kind(), OsErrorKind::NotFound);
        assert_eq!(OsError::new(3).kind(), OsErrorKind::NotFound);
        assert_eq!(OsError::new(120).kind(), OsErrorKind::Unsupported);
        assert_eq!(OsError::new(1450).kind(), OsErrorKind::Other);
    }

    #[test]
    fn test_process_gone_codes() {
        assert!(OsError::invalid_handle().indicates_process_gone());
        assert!(OsError::invalid_parameter().indicates_process_gone());
        assert!(!OsError::access_denied().indicates_process_gone());
    }

    #[test]
    fn test_more_data_is_its_own_case() {
        let err = OsError::new(ERROR_MORE_DATA);
        assert!(err.is_more_data());
        assert_eq!(err.kind(), OsErrorKind::Other);
        assert!(!err.indicates_process_gone());
        assert!(!OsError::invalid_parameter().is_more_data());
    }

    #[test]
    fn test_display_includes_code() {
        assert_eq!(
            OsError::access_denied().to_string(),
            "access denied (os error 5)"
        );
        assert_eq!(OsError::new(1450).to_string(), "os error 1450");
    }

    #[test]
    fn test_from_io_error_kind() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(OsError::from(err).kind(), OsErrorKind::NotFound);
    }
}
