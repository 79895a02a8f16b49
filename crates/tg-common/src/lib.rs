//! throttle-guard common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the engine crates:
//! - Process identity and enforcement phase types
//! - Classified OS error codes
//! - The critical-process deny-list and image-name rules
//! - The unified error type

pub mod error;
pub mod id;
pub mod names;
pub mod os_error;

pub use error::{Error, ErrorCategory, Result};
pub use id::{OperationMode, Phase, ProcessId};
pub use names::{is_critical_process, normalize_image_name, validate_image_name, NameError};
pub use os_error::{OsError, OsErrorKind};
