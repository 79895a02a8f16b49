//! throttle-guard core library
//!
//! Keeps selected applications, and every process they spawn, out of the
//! OS's power-saving throttling:
//! - Phase-driven enforcement engine (aggressive, stable, persistent)
//! - Process-start and thread-start event sources
//! - Descendant grouping and the persistent policy ledger
//! - Shared timer queue, health snapshot, structured logging
//!
//! The service binary entry point is in `main.rs`.

pub mod clock;
pub mod config_watch;
pub mod engine;
pub mod event_source;
pub mod exit_codes;
pub mod grouping;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod platform;
pub mod stop;
pub mod timers;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    Dispatcher, EngineConfig, EngineContext, EngineError, EnforcementRequest, InitReport,
    ProcessStart, RequestKind, StopReport,
};
pub use event_source::{EventSink, EventSource, ManualEventSource, SnapshotEventSource};
pub use exit_codes::ExitCode;
pub use health::{HealthSnapshot, HealthStatus};
pub use ledger::PolicyLedger;
pub use platform::{Platform, PolicyStore, ProcessExit};
pub use stop::{StopHandle, StopReason, StopSignal};
pub use timers::TimerQueue;
