//! Values carried on the engine's channels.

use tg_common::ProcessId;

/// Why a tracked process is being looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A thread was created in the process.
    ThreadEvent,
    /// Aggressive-phase verification step (1..=3). `generation` must match
    /// the process's current deferred timer or the request is stale.
    DeferredVerify { step: u8, generation: u64 },
    /// Recurring tick for a persistent process.
    PersistentTick,
    /// Low-frequency consistency check of a stable process.
    SafetyNetCheck,
    /// Backed-off retry after a failed override.
    RetryEnforce,
}

/// One unit of work for the dispatcher. Immutable once sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcementRequest {
    pub pid: ProcessId,
    pub kind: RequestKind,
}

impl EnforcementRequest {
    pub fn new(pid: ProcessId, kind: RequestKind) -> Self {
        Self { pid, kind }
    }

    pub fn thread_event(pid: ProcessId) -> Self {
        Self::new(pid, RequestKind::ThreadEvent)
    }

    pub fn safety_net(pid: ProcessId) -> Self {
        Self::new(pid, RequestKind::SafetyNetCheck)
    }
}

/// A process-creation event from the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStart {
    pub pid: ProcessId,
    pub parent: ProcessId,
    pub image: String,
}
