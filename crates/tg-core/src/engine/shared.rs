//! State shared between the control thread and callback threads.
//!
//! Callback threads never see the process table itself. They read a phase
//! index that the dispatcher keeps in sync, and bump counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use tg_common::{OperationMode, OsError, OsErrorKind, Phase, ProcessId};

/// Monotonic engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub wakeup_config_change: AtomicU64,
    pub wakeup_safety_net: AtomicU64,
    pub wakeup_enforcement_request: AtomicU64,
    pub wakeup_process_exit: AtomicU64,
    pub total_violations: AtomicU64,
    pub persistent_applied: AtomicU64,
    pub persistent_skipped: AtomicU64,
    pub retries: AtomicU64,
    pub handle_reopens: AtomicU64,
    pub dropped_requests: AtomicU64,
    pub errors_access_denied: AtomicU64,
    pub errors_invalid_parameter: AtomicU64,
    pub errors_invalid_handle: AtomicU64,
    pub errors_other: AtomicU64,
    pub shutdown_warnings: AtomicU64,
    pub config_changes_detected: AtomicU64,
    pub config_reloads: AtomicU64,
}

/// Relaxed increment.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Relaxed read.
pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl EngineStats {
    pub fn record_os_error(&self, err: OsError) {
        match err.kind() {
            OsErrorKind::AccessDenied => bump(&self.errors_access_denied),
            OsErrorKind::InvalidParameter => bump(&self.errors_invalid_parameter),
            OsErrorKind::InvalidHandle => bump(&self.errors_invalid_handle),
            _ => bump(&self.errors_other),
        }
    }
}

/// Phase per tracked pid, mirrored from the control thread's table.
#[derive(Debug, Default)]
pub struct PhaseIndex {
    phases: RwLock<HashMap<ProcessId, Phase>>,
}

/// Phase counts for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub aggressive: usize,
    pub stable: usize,
    pub persistent: usize,
}

impl PhaseCounts {
    pub fn total(&self) -> usize {
        self.aggressive + self.stable + self.persistent
    }
}

impl PhaseIndex {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ProcessId, Phase>> {
        self.phases.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ProcessId, Phase>> {
        self.phases.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, pid: ProcessId, phase: Phase) {
        self.write().insert(pid, phase);
    }

    pub fn remove(&self, pid: ProcessId) {
        self.write().remove(&pid);
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn phase(&self, pid: ProcessId) -> Option<Phase> {
        self.read().get(&pid).copied()
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.read().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pids currently in `phase`.
    pub fn pids_in(&self, phase: Phase) -> Vec<ProcessId> {
        let mut pids: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, p)| **p == phase)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort();
        pids
    }

    pub fn counts(&self) -> PhaseCounts {
        let mut counts = PhaseCounts::default();
        for phase in self.read().values() {
            match phase {
                Phase::Aggressive => counts.aggressive += 1,
                Phase::Stable => counts.stable += 1,
                Phase::Persistent => counts.persistent += 1,
            }
        }
        counts
    }
}

/// Everything the engine shares across threads.
#[derive(Debug, Default)]
pub struct EngineShared {
    pub stats: EngineStats,
    pub index: PhaseIndex,
    running: AtomicBool,
    mode: AtomicU8,
}

impl EngineShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn mode(&self) -> OperationMode {
        match self.mode.load(Ordering::SeqCst) {
            1 => OperationMode::DegradedEventSource,
            _ => OperationMode::Normal,
        }
    }

    pub fn set_mode(&self, mode: OperationMode) {
        let raw = match mode {
            OperationMode::Normal => 0,
            OperationMode::DegradedEventSource => 1,
        };
        self.mode.store(raw, Ordering::SeqCst);
    }
}
