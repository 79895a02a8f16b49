//! The on-disk target list and logging settings.
//!
//! File layout (`throttle-guard.ini` in the service base directory):
//!
//! ```text
//! [Logging]
//! LogLevel=INFO
//! LogEnabled=1
//!
//! [Targets]
//! game.exe=1
//! editor.exe=0
//! ```
//!
//! Loading is forgiving: invalid or critical target names are skipped with a
//! warning so one bad line never disables enforcement for the rest. Mutating
//! calls (`add_target` and friends) are strict and return errors instead.

use crate::error::{ConfigError, ConfigResult};
use crate::ini::{parse_flag, IniDocument, IniSection};
use crate::legacy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tg_common::{normalize_image_name, validate_image_name, NameError};
use tracing::{debug, info, warn};

pub const CONFIG_FILENAME: &str = "throttle-guard.ini";

/// Files larger than this are rejected outright.
pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

const SECTION_LOGGING: &str = "Logging";
const SECTION_TARGETS: &str = "Targets";

/// A configured target executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Name as written in the file (case preserved).
    pub name: String,
    pub enabled: bool,
}

/// Log level as spelled in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileLogLevel {
    Error,
    /// Operator-visible alerts; maps to `warn`.
    Alert,
    #[default]
    Info,
    Debug,
}

impl std::str::FromStr for FileLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(FileLogLevel::Error),
            "ALERT" | "WARN" | "WARNING" => Ok(FileLogLevel::Alert),
            "INFO" => Ok(FileLogLevel::Info),
            "DEBUG" => Ok(FileLogLevel::Debug),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

impl std::fmt::Display for FileLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileLogLevel::Error => write!(f, "ERROR"),
            FileLogLevel::Alert => write!(f, "ALERT"),
            FileLogLevel::Info => write!(f, "INFO"),
            FileLogLevel::Debug => write!(f, "DEBUG"),
        }
    }
}

/// Parsed configuration plus the bookkeeping needed for hot reload.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    targets: Vec<Target>,
    log_level: FileLogLevel,
    log_enabled: bool,
    last_modified: Option<SystemTime>,
}

impl ConfigStore {
    /// Load the config from `base_dir`, creating it when absent.
    ///
    /// A legacy JSON file is migrated first if no INI file exists yet.
    pub fn load(base_dir: &Path) -> ConfigResult<Self> {
        let path = base_dir.join(CONFIG_FILENAME);
        let mut store = Self::empty(path.clone());

        if path.exists() {
            store.reload()?;
            return Ok(store);
        }

        if let Some(targets) = legacy::read_legacy(base_dir)? {
            store.targets = sanitize_targets(targets);
            store.save()?;
            legacy::remove_legacy(base_dir)?;
            info!(
                path = %path.display(),
                targets = store.targets.len(),
                "migrated legacy JSON config"
            );
            return Ok(store);
        }

        store.save()?;
        info!(path = %path.display(), "created default config");
        Ok(store)
    }

    /// Open an existing config file without creating or migrating anything.
    pub fn open(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let mut store = Self::empty(path.to_path_buf());
        store.reload()?;
        Ok(store)
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            targets: Vec::new(),
            log_level: FileLogLevel::default(),
            log_enabled: true,
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file from disk.
    ///
    /// Returns whether the set of enabled target names changed. On error the
    /// previously loaded values are left untouched.
    pub fn reload(&mut self) -> ConfigResult<bool> {
        let size = std::fs::metadata(&self.path)
            .map_err(|source| self.read_error(source))?
            .len();
        if size > MAX_CONFIG_SIZE {
            return Err(ConfigError::TooLarge {
                path: self.path.clone(),
                size,
                limit: MAX_CONFIG_SIZE,
            });
        }

        let content =
            std::fs::read_to_string(&self.path).map_err(|source| self.read_error(source))?;
        let before = self.enabled_target_names();

        self.last_modified = modified_time(&self.path);
        self.apply_document(&IniDocument::parse(&content));

        Ok(before != self.enabled_target_names())
    }

    fn apply_document(&mut self, doc: &IniDocument) {
        let mut targets = Vec::new();
        let mut level = FileLogLevel::default();
        let mut enabled = true;

        for section in &doc.sections {
            if section.name.eq_ignore_ascii_case(SECTION_LOGGING) {
                for (key, value) in &section.entries {
                    if key.eq_ignore_ascii_case("LogLevel") {
                        match value.parse() {
                            Ok(parsed) => level = parsed,
                            Err(e) => warn!(value = %value, "config: {}", e),
                        }
                    } else if key.eq_ignore_ascii_case("LogEnabled") {
                        enabled = parse_flag(value);
                    } else {
                        debug!(key = %key, "config: unknown key in [Logging]");
                    }
                }
            } else if section.name.eq_ignore_ascii_case(SECTION_TARGETS) {
                targets.extend(section.entries.iter().map(|(name, value)| Target {
                    name: name.clone(),
                    enabled: parse_flag(value),
                }));
            } else {
                warn!(section = %section.name, "config: unknown section skipped");
            }
        }

        if doc.malformed_lines > 0 {
            warn!(lines = doc.malformed_lines, "config: malformed lines skipped");
        }

        self.targets = sanitize_targets(targets);
        self.log_level = level;
        self.log_enabled = enabled;
    }

    /// Write the current state back to disk.
    pub fn save(&mut self) -> ConfigResult<()> {
        let mut doc = IniDocument::default();

        let mut logging = IniSection::new(SECTION_LOGGING);
        logging.push("LogLevel", self.log_level.to_string());
        logging.push("LogEnabled", if self.log_enabled { "1" } else { "0" });
        doc.push_section(logging);

        let mut targets = IniSection::new(SECTION_TARGETS);
        for target in &self.targets {
            targets.push(target.name.clone(), if target.enabled { "1" } else { "0" });
        }
        doc.push_section(targets);

        let text = doc.render(&[
            "throttle-guard configuration",
            "LogLevel: ERROR, ALERT, INFO, DEBUG",
            "Targets: name.exe=1 (enabled) or name.exe=0 (disabled)",
        ]);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, text).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.last_modified = modified_time(&self.path);
        Ok(())
    }

    /// True when the file's modification time differs from the last load.
    pub fn has_changed_on_disk(&self) -> bool {
        modified_time(&self.path) != self.last_modified
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Lowercased names of enabled targets.
    pub fn enabled_target_names(&self) -> HashSet<String> {
        self.targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| normalize_image_name(&t.name))
            .collect()
    }

    pub fn add_target(&mut self, name: &str) -> ConfigResult<()> {
        validate_image_name(name)?;
        if self.find(name).is_some() {
            return Err(ConfigError::DuplicateTarget(name.to_string()));
        }
        self.targets.push(Target {
            name: name.to_string(),
            enabled: true,
        });
        Ok(())
    }

    pub fn remove_target(&mut self, name: &str) -> ConfigResult<()> {
        let idx = self
            .find(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))?;
        self.targets.remove(idx);
        Ok(())
    }

    pub fn set_target_enabled(&mut self, name: &str, enabled: bool) -> ConfigResult<()> {
        let idx = self
            .find(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))?;
        self.targets[idx].enabled = enabled;
        Ok(())
    }

    pub fn log_level(&self) -> FileLogLevel {
        self.log_level
    }

    pub fn log_enabled(&self) -> bool {
        self.log_enabled
    }

    pub fn set_log_level(&mut self, level: FileLogLevel) {
        self.log_level = level;
    }

    pub fn set_log_enabled(&mut self, enabled: bool) {
        self.log_enabled = enabled;
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.targets
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
    }

    fn read_error(&self, source: std::io::Error) -> ConfigError {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: self.path.clone(),
            }
        } else {
            ConfigError::Read {
                path: self.path.clone(),
                source,
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Drop invalid, critical, and duplicate names; first occurrence wins.
fn sanitize_targets(targets: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(targets.len());
    for target in targets {
        if let Err(err) = validate_image_name(&target.name) {
            match err {
                NameError::Critical(_) => {
                    warn!(target = %target.name, "config: critical process cannot be targeted")
                }
                _ => warn!(target = %target.name, error = %err, "config: invalid target skipped"),
            }
            continue;
        }
        if !seen.insert(target.name.to_ascii_lowercase()) {
            debug!(target = %target.name, "config: duplicate target collapsed");
            continue;
        }
        kept.push(target);
    }
    kept
}
