//! CLI tests for tgd.
//!
//! Cover argument handling, exit codes, and the JSON each command prints.
//! Commands that touch the host's policy store run only where the store is
//! the inert fallback.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command for the tgd binary.
fn tgd() -> Command {
    let mut cmd = Command::cargo_bin("tgd").expect("tgd binary should exist");
    cmd.env_remove("TG_BASE_DIR")
        .env_remove("TG_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn dir_with_config(body: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("throttle-guard.ini"), body).unwrap();
    dir
}

mod arguments {
    use super::*;

    #[test]
    fn unknown_command_fails() {
        tgd()
            .arg("nonexistent-command")
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn unknown_log_level_fails() {
        tgd()
            .args(["--log-level", "chatty", "version"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown log level"));
    }

    #[test]
    fn help_lists_commands() {
        tgd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("remove-policies"))
            .stdout(predicate::str::contains("check-config"));
    }
}

mod version {
    use super::*;

    #[test]
    fn version_prints_json() {
        let output = tgd().arg("version").output().unwrap();
        assert_eq!(output.status.code(), Some(0));
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["tgd_version"], env!("CARGO_PKG_VERSION"));
        assert!(json["platform_supported"].is_boolean());
    }
}

mod check_config {
    use super::*;

    #[test]
    fn valid_config_prints_targets() {
        let dir = dir_with_config("[Logging]\nLogLevel=DEBUG\n\n[Targets]\ngame.exe=1\neditor.exe=0\n");
        let output = tgd()
            .args(["check-config", "--base-dir"])
            .arg(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success());

        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["valid"], true);
        assert_eq!(json["log_level"], "DEBUG");
        let targets = json["targets"].as_array().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0]["name"], "game.exe");
        assert_eq!(targets[1]["enabled"], false);
    }

    #[test]
    fn missing_config_is_config_error() {
        let dir = TempDir::new().unwrap();
        tgd()
            .args(["check-config", "--base-dir"])
            .arg(dir.path())
            .assert()
            .code(11)
            .stdout(predicate::str::contains("\"valid\": false"));
        // checking never creates the file
        assert!(!dir.path().join("throttle-guard.ini").exists());
    }

    #[test]
    fn errors_reach_log_file_before_exit() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("tgd.log");
        tgd()
            .args(["check-config", "--log-format", "jsonl", "--log-file"])
            .arg(&log)
            .arg("--base-dir")
            .arg(dir.path())
            .assert()
            .code(11)
            .stderr(predicate::str::is_empty());
        let written = fs::read_to_string(&log).unwrap();
        assert!(written.contains("config check failed"));
    }

    #[test]
    fn base_dir_from_env() {
        let dir = dir_with_config("[Targets]\ngame.exe=1\n");
        tgd()
            .arg("check-config")
            .env("TG_BASE_DIR", dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("game.exe"));
    }
}

#[cfg(not(target_os = "windows"))]
mod unsupported_host {
    use super::*;

    #[test]
    fn run_refuses_without_power_controls() {
        let dir = dir_with_config("[Targets]\ngame.exe=1\n");
        tgd()
            .args(["run", "--duration-secs", "0", "--base-dir"])
            .arg(dir.path())
            .assert()
            .code(13);
    }

    #[test]
    fn remove_policies_clears_manifest() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("applied-policies.ini");
        fs::write(&manifest, "[AppliedPolicies]\ngame.exe=C:\\Games\\game.exe\n").unwrap();

        let output = tgd()
            .args(["remove-policies", "--base-dir"])
            .arg(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["removed"], 1);
        assert_eq!(json["remaining"], 0);
        assert!(!manifest.exists());
    }

    #[test]
    fn health_reports_targets_and_recorded_policies() {
        let dir = dir_with_config("[Targets]\ngame.exe=1\n");
        fs::write(
            dir.path().join("applied-policies.ini"),
            "[AppliedPolicies]\ngame.exe=C:\\Games\\game.exe\n",
        )
        .unwrap();

        let output = tgd()
            .args(["health", "--base-dir"])
            .arg(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["platform_supported"], false);
        assert!(json["snapshot_error"].is_string());
        assert_eq!(json["targets"][0]["name"], "game.exe");
        assert_eq!(json["targets"][0]["policy_recorded"], true);
        assert_eq!(json["recorded_policies"][0], "game.exe");
    }
}
