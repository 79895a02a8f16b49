//! Engine lifecycle integration tests.
//!
//! Run the real control thread and timer worker against the mock platform
//! and a manual event source:
//! - init / start / stop ordering and errors
//! - start events, health snapshot, policy cleanup on stop
//! - config hot reload and degraded event-source mode

use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tg_common::{OperationMode, Phase, ProcessId};
use tg_config::CONFIG_FILENAME;
use tg_core::engine::{EngineConfig, EngineError};
use tg_core::health::HealthStatus;
use tg_core::ledger::MANIFEST_FILENAME;
use tg_core::platform::mock::{MockPlatform, MockPolicyStore};
use tg_core::{assert_err, assert_ok, EngineContext, ManualEventSource};

const WAIT: Duration = Duration::from_secs(5);

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn write_config(dir: &Path, targets: &[&str]) {
    let mut text = String::from("[Logging]\nLogLevel=INFO\nLogEnabled=1\n\n[Targets]\n");
    for t in targets {
        text.push_str(&format!("{t}=1\n"));
    }
    let path = dir.join(CONFIG_FILENAME);
    fs::write(&path, text).unwrap();
}

/// Short intervals so phases settle in milliseconds.
fn fast_config() -> EngineConfig {
    EngineConfig {
        verify_delays_ms: [10, 10, 10],
        safety_net_ms: 50,
        config_debounce_ms: 50,
        health_check_ms: 50,
        degraded_rescan_ms: 50,
        group_refresh_ms: 50,
        ..EngineConfig::default()
    }
}

/// Field order matters: the engine drops (and stops) before the directory.
struct Fixture {
    engine: EngineContext,
    source: Arc<ManualEventSource>,
    platform: MockPlatform,
    policies: MockPolicyStore,
    dir: TempDir,
}

fn fixture(targets: &[&str], platform: MockPlatform) -> Fixture {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), targets);
    let policies = MockPolicyStore::new();
    let engine = EngineContext::new(
        dir.path(),
        Arc::new(platform.clone()),
        Arc::new(policies.clone()),
    )
    .with_config(fast_config());
    Fixture {
        engine,
        source: Arc::new(ManualEventSource::new()),
        platform,
        policies,
        dir,
    }
}

fn phase(engine: &EngineContext, pid: u32) -> Option<Phase> {
    engine.shared().index.phase(ProcessId(pid))
}

#[test]
fn test_start_before_init_fails() {
    let mut f = fixture(&["game.exe"], MockPlatform::new());
    let err = f.engine.start(f.source.clone()).unwrap_err();
    assert!(matches!(err, EngineError::NotInitialized));
    assert_err!(f.engine.stop());
}

#[test]
fn test_full_lifecycle() {
    let platform = MockPlatform::new()
        .with_process(100, 1, "game.exe")
        .with_child(101, 100, "helper.exe");
    let mut f = fixture(&["game.exe", "editor.exe"], platform);

    let report = assert_ok!(f.engine.init());
    assert_eq!(report.targets, 2);
    assert_eq!(report.enabled_targets, 2);
    assert_eq!(report.recorded_policies, 0);

    assert_ok!(f.engine.start(f.source.clone()));
    assert!(f.engine.is_running());
    assert!(matches!(
        f.engine.start(f.source.clone()),
        Err(EngineError::AlreadyRunning)
    ));

    // initial scan picks up the running tree
    wait_for("initial scan to settle", || {
        phase(&f.engine, 100) == Some(Phase::Stable) && phase(&f.engine, 101) == Some(Phase::Stable)
    });
    assert!(f.policies.has_override("game.exe"));

    // a start event for a new target
    f.platform.spawn(200, 1, "editor.exe");
    assert!(f.source.emit_process(200, 1, "editor.exe"));
    wait_for("editor to be tracked", || phase(&f.engine, 200).is_some());

    let health = f.engine.health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.engine_running);
    assert_eq!(health.mode, OperationMode::Normal);
    assert_eq!(health.active_processes, 3);
    assert_eq!(health.event_source.event_count, 1);

    // exit through the watch path
    f.platform.exit(101);
    wait_for("helper exit", || phase(&f.engine, 101).is_none());

    let stop = assert_ok!(f.engine.stop());
    assert_eq!(stop.policies_removed, 2);
    assert_eq!(stop.warnings, 0);
    assert!(f.policies.is_empty());
    assert!(!f.dir.path().join(MANIFEST_FILENAME).exists());
    assert!(!f.source.is_running());
    assert!(f.engine.shared().index.is_empty());
    assert_eq!(f.platform.watches_dropped(), 3);

    let health = f.engine.health();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(!health.engine_running);
    assert!(matches!(f.engine.stop(), Err(EngineError::NotRunning)));
}

#[test]
fn test_leftover_manifest_reversed_on_stop() {
    let mut f = fixture(&["game.exe"], MockPlatform::new());
    fs::write(
        f.dir.path().join(MANIFEST_FILENAME),
        "[AppliedPolicies]\nold.exe=C:\\Games\\old.exe\n",
    )
    .unwrap();
    f.policies.seed("C:\\Games\\old.exe", "old.exe");

    let report = assert_ok!(f.engine.init());
    assert_eq!(report.recorded_policies, 1);
    assert_ok!(f.engine.start(f.source.clone()));

    let stop = assert_ok!(f.engine.stop());
    assert_eq!(stop.policies_removed, 1);
    assert!(f.policies.is_empty());
}

#[test]
fn test_config_reload_reconciles_targets() {
    let platform = MockPlatform::new()
        .with_process(100, 1, "game.exe")
        .with_process(200, 1, "editor.exe");
    let mut f = fixture(&["game.exe"], platform);
    assert_ok!(f.engine.init());
    assert_ok!(f.engine.start(f.source.clone()));
    wait_for("game tracked", || phase(&f.engine, 100).is_some());
    assert!(phase(&f.engine, 200).is_none());

    write_config(f.dir.path(), &["editor.exe"]);
    let path = f.dir.path().join(CONFIG_FILENAME);
    set_file_mtime(&path, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();

    wait_for("reconciliation", || {
        phase(&f.engine, 200).is_some() && phase(&f.engine, 100).is_none()
    });
    let health = f.engine.health();
    assert!(health.config.reloads >= 1);
    assert!(health.config.changes_detected >= 1);

    let stop = assert_ok!(f.engine.stop());
    // both images were applied at some point; both are reversed
    assert_eq!(stop.policies_removed, 2);
}

#[test]
fn test_unhealthy_source_degrades_and_recovers() {
    let platform = MockPlatform::new().with_process(100, 1, "game.exe");
    let mut f = fixture(&["game.exe"], platform);
    assert_ok!(f.engine.init());
    assert_ok!(f.engine.start(f.source.clone()));
    wait_for("game tracked", || phase(&f.engine, 100).is_some());

    f.source.fail_restarts(true);
    f.source.set_healthy(false);
    wait_for("degraded mode", || {
        f.engine.shared().mode() == OperationMode::DegradedEventSource
    });
    assert_eq!(f.engine.health().status, HealthStatus::Degraded);
    assert!(f.source.restarts() >= 1);

    // degraded rescans still find new targets without events
    f.platform.spawn(300, 1, "game.exe");
    wait_for("rescan picks up new pid", || phase(&f.engine, 300).is_some());

    f.source.fail_restarts(false);
    wait_for("recovery", || f.engine.shared().mode() == OperationMode::Normal);
    assert_eq!(f.engine.health().status, HealthStatus::Healthy);

    assert_ok!(f.engine.stop());
}

#[test]
fn test_drop_stops_running_engine() {
    let platform = MockPlatform::new().with_process(100, 1, "game.exe");
    let mut f = fixture(&["game.exe"], platform);
    assert_ok!(f.engine.init());
    assert_ok!(f.engine.start(f.source.clone()));
    wait_for("game tracked", || phase(&f.engine, 100).is_some());

    let policies = f.policies.clone();
    let source = f.source.clone();
    drop(f);
    assert!(policies.is_empty());
    assert!(!source.is_running());
}
