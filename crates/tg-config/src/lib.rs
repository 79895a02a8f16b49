//! throttle-guard configuration loading and validation.
//!
//! This crate provides:
//! - A lenient INI reader/writer shared with the policy manifest
//! - The on-disk target list and logging settings (`ConfigStore`)
//! - One-shot migration from the legacy JSON layout
//! - Modification-time change detection for hot reload

pub mod error;
pub mod ini;
pub mod legacy;
pub mod store;

pub use error::{ConfigError, ConfigResult};
pub use ini::{IniDocument, IniSection};
pub use store::{ConfigStore, FileLogLevel, Target, CONFIG_FILENAME, MAX_CONFIG_SIZE};
