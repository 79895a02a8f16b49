//! Image-name rules shared by the config store and the engine.
//!
//! Targets are identified by bare executable names (`game.exe`), compared
//! case-insensitively. A fixed deny-list of critical system processes can
//! never be targeted, tracked as a child, or adopted from a process group.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Maximum image-name length (MAX_PATH).
pub const MAX_IMAGE_NAME_LEN: usize = 260;

/// Critical processes, lowercase. Touching their power state can destabilise
/// the session, and our own binaries must never chase themselves.
pub const CRITICAL_PROCESSES: &[&str] = &[
    "system",
    "registry",
    "idle",
    "ntoskrnl.exe",
    "smss.exe",
    "csrss.exe",
    "wininit.exe",
    "services.exe",
    "lsass.exe",
    "winlogon.exe",
    "svchost.exe",
    "explorer.exe",
    "dwm.exe",
    "ctfmon.exe",
    "tgd.exe",
];

/// Why an image name was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("image name is empty")]
    Empty,

    #[error("image name exceeds {max} characters")]
    TooLong { max: usize },

    #[error("image name must be a bare file name, not a path: {0}")]
    PathLike(String),

    #[error("image name contains invalid characters: {0}")]
    InvalidCharacters(String),

    #[error("image name must end in .exe: {0}")]
    NotExecutable(String),

    #[error("{0} is a critical system process")]
    Critical(String),
}

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\- ]+$").ok())
        .as_ref()
}

/// Lowercase a name and strip any directory prefix.
///
/// Event sources sometimes report full paths; the engine only keys on the
/// final component.
pub fn normalize_image_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let base = trimmed
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(trimmed);
    base.to_ascii_lowercase()
}

/// Case-insensitive deny-list check on a bare or path-qualified name.
pub fn is_critical_process(name: &str) -> bool {
    let normalized = normalize_image_name(name);
    CRITICAL_PROCESSES.iter().any(|c| *c == normalized)
}

/// Validate a user-supplied target name.
pub fn validate_image_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() > MAX_IMAGE_NAME_LEN {
        return Err(NameError::TooLong {
            max: MAX_IMAGE_NAME_LEN,
        });
    }
    if name.contains("..")
        || name.contains('\\')
        || name.contains('/')
        || name.starts_with("\\\\")
        || has_drive_prefix(name)
    {
        return Err(NameError::PathLike(name.to_string()));
    }
    let allowed = match name_pattern() {
        Some(re) => re.is_match(name),
        None => name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' ')),
    };
    if !allowed {
        return Err(NameError::InvalidCharacters(name.to_string()));
    }
    if !name.to_ascii_lowercase().ends_with(".exe") || name.len() <= 4 {
        return Err(NameError::NotExecutable(name.to_string()));
    }
    if is_critical_process(name) {
        return Err(NameError::Critical(name.to_string()));
    }
    Ok(())
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
