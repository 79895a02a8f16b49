//! Tracked-process records.
//!
//! The table lives on the control thread and is deliberately `!Send`: it
//! is built inside that thread and never handed to callbacks.

use super::healing::HealingState;
use crate::platform::{ExitWatch, ProcessControl, ProcessExit};
use crate::timers::TimerGuard;
use std::collections::HashMap;
use std::marker::PhantomData;
use tg_common::{Phase, ProcessId};

/// Everything the engine knows about one enforced process.
///
/// Field order matters: timer guards drop first (each waits for an
/// in-flight callback), then the exit watch, then the control handle.
pub struct TrackedProcess {
    pub(crate) deferred: Option<TimerGuard>,
    pub(crate) persistent: Option<TimerGuard>,
    pub(crate) retry: Option<TimerGuard>,
    pub(crate) exit_watch: Option<Box<dyn ExitWatch>>,
    pub(crate) control: Option<Box<dyn ProcessControl>>,

    pub pid: ProcessId,
    pub parent: ProcessId,
    /// Lowercased bare image name.
    pub image: String,
    pub is_child: bool,
    /// Root of the tree this process was tracked under (itself for roots).
    pub root: ProcessId,

    pub phase: Phase,
    pub phase_started_ms: u64,
    pub last_check_ms: u64,
    pub violations: u32,
    pub last_violation_ms: Option<u64>,
    pub last_thread_enforce_ms: Option<u64>,

    pub healing: HealingState,
    pub in_group: bool,
    pub group_assignment_failed: bool,

    /// Distinguishes this record from earlier ones for the same pid.
    pub(crate) track_generation: u64,
    /// Ticket of the currently armed deferred verification.
    pub(crate) deferred_generation: u64,
    pub(crate) deferred_step: u8,
}

impl std::fmt::Debug for TrackedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedProcess")
            .field("pid", &self.pid)
            .field("image", &self.image)
            .field("phase", &self.phase)
            .field("violations", &self.violations)
            .field("is_child", &self.is_child)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl TrackedProcess {
    pub(crate) fn new(
        pid: ProcessId,
        parent: ProcessId,
        image: String,
        root: Option<ProcessId>,
        control: Box<dyn ProcessControl>,
        track_generation: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            deferred: None,
            persistent: None,
            retry: None,
            exit_watch: None,
            control: Some(control),
            pid,
            parent,
            image,
            is_child: root.is_some(),
            root: root.unwrap_or(pid),
            phase: Phase::Aggressive,
            phase_started_ms: now_ms,
            last_check_ms: now_ms,
            violations: 0,
            last_violation_ms: None,
            last_thread_enforce_ms: None,
            healing: HealingState::default(),
            in_group: false,
            group_assignment_failed: false,
            track_generation,
            deferred_generation: 0,
            deferred_step: 0,
        }
    }

    pub fn has_handle(&self) -> bool {
        self.control.is_some()
    }

    /// Live according to an open handle. False once the handle is released.
    pub fn is_alive(&self) -> bool {
        self.control.as_ref().is_some_and(|c| c.is_alive())
    }

    /// The exit notification this record's watch delivers.
    pub fn exit_notice(&self) -> ProcessExit {
        ProcessExit {
            pid: self.pid,
            generation: self.track_generation,
        }
    }

    /// Read-only copy for callers outside the control thread's borrow.
    pub fn view(&self) -> ProcessView {
        ProcessView {
            pid: self.pid,
            image: self.image.clone(),
            is_child: self.is_child,
            root: self.root,
            phase: self.phase,
            violations: self.violations,
            in_group: self.in_group,
            group_assignment_failed: self.group_assignment_failed,
            has_handle: self.control.is_some(),
            deferred_armed: self.deferred.is_some(),
            deferred_step: self.deferred_step,
            persistent_armed: self.persistent.is_some(),
            retry_armed: self.retry.is_some(),
            consecutive_failures: self.healing.consecutive_failures,
        }
    }
}

/// Snapshot of a tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessView {
    pub pid: ProcessId,
    pub image: String,
    pub is_child: bool,
    pub root: ProcessId,
    pub phase: Phase,
    pub violations: u32,
    pub in_group: bool,
    pub group_assignment_failed: bool,
    pub has_handle: bool,
    pub deferred_armed: bool,
    pub deferred_step: u8,
    pub persistent_armed: bool,
    pub retry_armed: bool,
    pub consecutive_failures: u32,
}

/// Pid-keyed tracked set owned by the control thread.
pub struct ProcessTable {
    entries: HashMap<ProcessId, TrackedProcess>,
    _not_send: PhantomData<*const ()>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            _not_send: PhantomData,
        }
    }

    pub fn get(&self, pid: ProcessId) -> Option<&TrackedProcess> {
        self.entries.get(&pid)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut TrackedProcess> {
        self.entries.get_mut(&pid)
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.entries.contains_key(&pid)
    }

    pub(crate) fn insert(&mut self, process: TrackedProcess) {
        self.entries.insert(process.pid, process);
    }

    pub(crate) fn remove(&mut self, pid: ProcessId) -> Option<TrackedProcess> {
        self.entries.remove(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedProcess> {
        self.entries.values()
    }

    /// Tracked pids in ascending order.
    pub fn pids(&self) -> Vec<ProcessId> {
        let mut pids: Vec<_> = self.entries.keys().copied().collect();
        pids.sort();
        pids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every record, releasing timers, watches and handles in that order.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.entries.len();
        for (_, process) in self.entries.drain() {
            drop(process);
        }
        n
    }
}
