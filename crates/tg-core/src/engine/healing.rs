//! Failure classification for override pulses.

use super::EngineConfig;
use tg_common::{OsError, OsErrorKind};

/// What to do after a failed override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Schedule a retry after this many milliseconds.
    RetryAfter(u64),
    /// Stop retrying until the next natural trigger.
    GiveUp,
    /// The handle is stale; close it and wait for the exit path.
    ReleaseHandle,
    /// Liveness check says the process is gone.
    ProcessGone,
}

/// Per-process failure bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealingState {
    pub consecutive_failures: u32,
    pub last_error: Option<OsError>,
    /// Set once a give-up has been logged so it is not repeated.
    pub gave_up: bool,
}

impl HealingState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a failure and return the attempt number it represents.
    pub fn record(&mut self, err: OsError) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(err);
        self.consecutive_failures
    }
}

/// Decide how to recover from `err` on failure number `attempt` (1-based).
///
/// `alive` is the independent liveness re-check; a dead process is never
/// retried.
pub fn classify(err: OsError, attempt: u32, alive: bool, config: &EngineConfig) -> Recovery {
    if !alive {
        return Recovery::ProcessGone;
    }
    match err.kind() {
        OsErrorKind::InvalidHandle | OsErrorKind::InvalidParameter => Recovery::ReleaseHandle,
        OsErrorKind::AccessDenied => {
            if attempt <= config.access_denied_retries {
                Recovery::RetryAfter(config.retry_backoff_ms)
            } else {
                Recovery::GiveUp
            }
        }
        _ => {
            if attempt <= config.max_retries {
                let shift = attempt.saturating_sub(1).min(16);
                Recovery::RetryAfter(config.retry_backoff_ms.saturating_mul(1 << shift))
            } else {
                Recovery::GiveUp
            }
        }
    }
}
