//! Migration from the legacy JSON target list.
//!
//! Older installs kept targets in `throttle-guard.json`:
//!
//! ```json
//! { "targets": [ { "name": "game.exe", "enabled": true } ] }
//! ```
//!
//! On first load the JSON is converted to INI and the JSON file removed.

use crate::error::{ConfigError, ConfigResult};
use crate::store::Target;
use serde::Deserialize;
use std::path::Path;

pub const LEGACY_CONFIG_FILENAME: &str = "throttle-guard.json";

#[derive(Debug, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    targets: Vec<LegacyTarget>,
}

#[derive(Debug, Deserialize)]
struct LegacyTarget {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Read the legacy file in `base_dir`, if present.
///
/// Returns `Ok(None)` when there is nothing to migrate. Target names are not
/// validated here; the store filters them exactly as it does for INI input.
pub fn read_legacy(base_dir: &Path) -> ConfigResult<Option<Vec<Target>>> {
    let path = base_dir.join(LEGACY_CONFIG_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
    let parsed: LegacyConfig =
        serde_json::from_str(content).map_err(|source| ConfigError::Legacy {
            path: path.clone(),
            source,
        })?;

    Ok(Some(
        parsed
            .targets
            .into_iter()
            .map(|t| Target {
                name: t.name,
                enabled: t.enabled,
            })
            .collect(),
    ))
}

/// Delete the legacy file after a successful migration.
pub fn remove_legacy(base_dir: &Path) -> ConfigResult<()> {
    let path = base_dir.join(LEGACY_CONFIG_FILENAME);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ConfigError::Write { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_legacy_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_legacy(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_reads_targets_with_default_enabled() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LEGACY_CONFIG_FILENAME),
            r#"{"targets":[{"name":"a.exe"},{"name":"b.exe","enabled":false}]}"#,
        )
        .unwrap();
        let targets = read_legacy(dir.path()).unwrap().unwrap();
        assert_eq!(
            targets,
            vec![
                Target { name: "a.exe".into(), enabled: true },
                Target { name: "b.exe".into(), enabled: false },
            ]
        );
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LEGACY_CONFIG_FILENAME), "{not json").unwrap();
        let err = read_legacy(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Legacy { .. }));
    }
}
