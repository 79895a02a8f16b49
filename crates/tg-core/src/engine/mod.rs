//! Power-state enforcement engine.
//!
//! [`EngineContext`] owns the lifecycle: `init` loads configuration and the
//! policy ledger, `start` spawns the control thread and the event source,
//! `stop` tears everything down in order and reverses recorded policies.
//!
//! Threads:
//! - `tg-control`: the only thread that touches the tracked-process table.
//! - `tg-timers`: fires deferred-verify, persistent and retry timers; each
//!   callback only enqueues a request.
//! - event source and exit-watch callbacks: enqueue only.

pub mod control;
pub mod dispatch;
pub mod healing;
pub mod request;
pub mod scan;
pub mod shared;
pub mod table;

pub use control::{ControlChannels, ControlLoop};
pub use dispatch::{DispatchContext, Dispatcher};
pub use healing::{HealingState, Recovery};
pub use request::{EnforcementRequest, ProcessStart, RequestKind};
pub use scan::ReconcileOutcome;
pub use shared::{EngineShared, EngineStats, PhaseCounts, PhaseIndex};
pub use table::{ProcessTable, ProcessView, TrackedProcess};

use crate::clock::{Clock, SystemClock};
use crate::config_watch::ConfigWatcher;
use crate::event_source::{EventSink, EventSource};
use crate::health::{EventSourceSummary, HealthSnapshot};
use crate::ledger::{LedgerError, PolicyLedger};
use crate::platform::{Platform, PolicyStore};
use crate::timers::TimerQueue;
use crossbeam_channel::{bounded, unbounded, Sender};
use serde::{Deserialize, Serialize};
use shared::bump;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tg_common::OperationMode;
use tg_config::{ConfigError, ConfigStore};
use thiserror::Error;
use tracing::{error, info, warn};

/// Number of deferred verification steps in the aggressive phase.
pub const VERIFY_STEPS: u8 = 3;

/// Every interval and threshold the engine uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before each verification step, relative to the previous one.
    pub verify_delays_ms: [u64; VERIFY_STEPS as usize],
    pub persistent_interval_ms: u64,
    /// Quiet time after which a persistent process is considered settled.
    pub persistent_clean_ms: u64,
    pub thread_event_rate_limit_ms: u64,
    pub violation_threshold: u32,
    pub safety_net_ms: u64,
    pub config_debounce_ms: u64,
    pub health_check_ms: u64,
    pub degraded_rescan_ms: u64,
    pub group_refresh_ms: u64,
    pub stats_interval_ms: u64,
    pub max_group_pids: usize,
    pub request_queue_capacity: usize,
    /// Access-denied failures retried before giving up.
    pub access_denied_retries: u32,
    /// Attempts for unclassified failures.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub error_log_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_delays_ms: [200, 800, 2000],
            persistent_interval_ms: 5_000,
            persistent_clean_ms: 60_000,
            thread_event_rate_limit_ms: 1_000,
            violation_threshold: 3,
            safety_net_ms: 10_000,
            config_debounce_ms: 2_000,
            health_check_ms: 30_000,
            degraded_rescan_ms: 30_000,
            group_refresh_ms: 5_000,
            stats_interval_ms: 60_000,
            max_group_pids: crate::grouping::MAX_GROUP_PIDS,
            request_queue_capacity: 4_096,
            access_denied_retries: 2,
            max_retries: 5,
            retry_backoff_ms: 50,
            error_log_window_ms: 60_000,
        }
    }
}

/// Engine lifecycle errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine not running")]
    NotRunning,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<EngineError> for tg_common::Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Config(e) => e.into(),
            EngineError::Ledger(e) => e.into(),
            EngineError::Spawn { source, .. } => tg_common::Error::Io(source),
            other => tg_common::Error::Engine(other.to_string()),
        }
    }
}

/// What `init` found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub targets: usize,
    pub enabled_targets: usize,
    /// Ledger entries left behind by a previous run.
    pub recorded_policies: usize,
}

/// Outcome of `stop`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub policies_removed: usize,
    pub warnings: u64,
}

struct Runtime {
    stop: Sender<()>,
    control: JoinHandle<()>,
    timers: TimerQueue,
    source: Arc<dyn EventSource>,
    watcher: Option<ConfigWatcher>,
    started_ms: u64,
}

/// Top-level handle to the engine.
pub struct EngineContext {
    config: EngineConfig,
    base_dir: PathBuf,
    platform: Arc<dyn Platform>,
    policies: Arc<dyn PolicyStore>,
    clock: Arc<dyn Clock>,
    shared: Arc<EngineShared>,
    store: Option<ConfigStore>,
    ledger: Option<Arc<Mutex<PolicyLedger>>>,
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("base_dir", &self.base_dir)
            .field("initialized", &self.ledger.is_some())
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

impl EngineContext {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        platform: Arc<dyn Platform>,
        policies: Arc<dyn PolicyStore>,
    ) -> Self {
        Self {
            config: EngineConfig::default(),
            base_dir: base_dir.into(),
            platform,
            policies,
            clock: Arc::new(SystemClock::new()),
            shared: Arc::new(EngineShared::new()),
            store: None,
            ledger: None,
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Load configuration and the policy ledger.
    pub fn init(&mut self) -> Result<InitReport, EngineError> {
        if self.runtime.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let store = ConfigStore::load(&self.base_dir)?;
        let mut ledger = PolicyLedger::open(&self.base_dir, Arc::clone(&self.policies));
        let recorded = ledger.load()?;
        if recorded > 0 {
            warn!(
                entries = recorded,
                "policy ledger has entries from a previous run; they will be reversed at shutdown"
            );
        }

        let report = InitReport {
            targets: store.targets().len(),
            enabled_targets: store.enabled_target_names().len(),
            recorded_policies: recorded,
        };
        info!(
            base_dir = %self.base_dir.display(),
            targets = report.targets,
            enabled = report.enabled_targets,
            "engine initialized"
        );
        self.store = Some(store);
        self.ledger = Some(Arc::new(Mutex::new(ledger)));
        Ok(report)
    }

    /// Spawn the control thread and start `source`.
    ///
    /// An event source that fails to start leaves the engine running in
    /// degraded mode.
    pub fn start(&mut self, source: Arc<dyn EventSource>) -> Result<(), EngineError> {
        if self.runtime.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let ledger = self.ledger.clone().ok_or(EngineError::NotInitialized)?;
        let store = self.store.take().ok_or(EngineError::NotInitialized)?;

        let capacity = self.config.request_queue_capacity.max(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (config_tx, config_rx) = bounded::<()>(1);
        let (request_tx, request_rx) = bounded(capacity);
        let (start_tx, start_rx) = bounded(capacity);
        let (exit_tx, exit_rx) = unbounded();

        let watcher = match ConfigWatcher::new(&self.base_dir, config_tx) {
            Ok(w) => Some(w),
            Err(err) => {
                warn!(error = %err, "config watch unavailable, changes need a restart");
                None
            }
        };

        let timers = TimerQueue::start(Arc::clone(&self.clock)).map_err(|source| {
            EngineError::Spawn {
                name: "timer",
                source,
            }
        })?;

        let ctx = DispatchContext {
            platform: Arc::clone(&self.platform),
            timers: timers.clone(),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            ledger,
            requests: request_tx.clone(),
            exits: exit_tx,
        };
        let channels = ControlChannels {
            stop: stop_rx,
            config: config_rx,
            requests: request_rx,
            starts: start_rx,
            exits: exit_rx,
        };
        let loop_source = Arc::clone(&source);
        let clock = Arc::clone(&self.clock);
        let shared = Arc::clone(&self.shared);

        self.shared.set_mode(OperationMode::Normal);
        self.shared.set_running(true);
        let control = thread::Builder::new()
            .name("tg-control".to_string())
            .spawn(move || {
                let dispatcher = Dispatcher::new(ctx);
                let mut control =
                    ControlLoop::new(dispatcher, store, loop_source, channels, clock, shared);
                control.start_up();
                control.run();
            })
            .map_err(|source| {
                self.shared.set_running(false);
                timers.shutdown();
                EngineError::Spawn {
                    name: "control",
                    source,
                }
            })?;

        let sink = EventSink::new(start_tx, request_tx, Arc::clone(&self.shared));
        if let Err(err) = source.start(sink) {
            warn!(source = source.name(), error = %err, "event source failed to start");
            self.shared.set_mode(OperationMode::DegradedEventSource);
        }

        self.runtime = Some(Runtime {
            stop: stop_tx,
            control,
            timers,
            source,
            watcher,
            started_ms: self.clock.now_ms(),
        });
        info!("engine started");
        Ok(())
    }

    /// Stop everything and reverse recorded policies.
    ///
    /// Order: stop signal, event source, control thread (which drains
    /// exits, stops timers and frees per-process resources), timer facility,
    /// then the ledger.
    pub fn stop(&mut self) -> Result<StopReport, EngineError> {
        let runtime = self.runtime.take().ok_or(EngineError::NotRunning)?;
        let stats = &self.shared.stats;
        let warnings_before = shared::read(&stats.shutdown_warnings);

        let _ = runtime.stop.send(());
        runtime.source.stop();
        drop(runtime.watcher);
        if runtime.control.join().is_err() {
            error!("control thread panicked");
            bump(&stats.shutdown_warnings);
        }
        runtime.timers.shutdown();
        self.shared.set_running(false);

        let policies_removed = match &self.ledger {
            Some(ledger) => {
                let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                match ledger.remove_all() {
                    Ok(n) => n,
                    Err(err) => {
                        warn!(error = %err, "policy cleanup incomplete");
                        bump(&stats.shutdown_warnings);
                        0
                    }
                }
            }
            None => 0,
        };

        let report = StopReport {
            policies_removed,
            warnings: shared::read(&stats.shutdown_warnings) - warnings_before,
        };
        info!(
            policies_removed = report.policies_removed,
            warnings = report.warnings,
            "engine stopped"
        );
        Ok(report)
    }

    pub fn health(&self) -> HealthSnapshot {
        let (source, uptime_ms) = match &self.runtime {
            Some(rt) => (
                EventSourceSummary {
                    healthy: rt.source.is_healthy(),
                    event_count: rt.source.event_count(),
                },
                self.clock.now_ms().saturating_sub(rt.started_ms),
            ),
            None => (EventSourceSummary::default(), 0),
        };
        HealthSnapshot::collect(&self.shared, source, uptime_ms)
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            if let Err(err) = self.stop() {
                warn!(error = %err, "engine stop during drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.verify_delays_ms, [200, 800, 2000]);
        assert_eq!(cfg.persistent_interval_ms, 5_000);
        assert_eq!(cfg.persistent_clean_ms, 60_000);
        assert_eq!(cfg.violation_threshold, 3);
        assert_eq!(cfg.max_group_pids, 1024);
        assert_eq!(cfg.request_queue_capacity, 4096);
    }

    #[test]
    fn test_config_partial_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"safety_net_ms": 500, "violation_threshold": 5}"#).unwrap();
        assert_eq!(cfg.safety_net_ms, 500);
        assert_eq!(cfg.violation_threshold, 5);
        assert_eq!(cfg.persistent_interval_ms, 5_000);
    }

    #[test]
    fn test_engine_error_maps_to_common() {
        let err: tg_common::Error = EngineError::AlreadyRunning.into();
        assert_eq!(err.code(), 40);
        let err: tg_common::Error = EngineError::Spawn {
            name: "control",
            source: std::io::Error::new(std::io::ErrorKind::Other, "no threads"),
        }
        .into();
        assert_eq!(err.code(), 60);
    }
}
