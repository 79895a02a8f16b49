//! Process identity and engine state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID wrapper with display formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The idle process; never a valid enforcement target.
    pub const IDLE: ProcessId = ProcessId(0);

    /// Pids 0 and 4 belong to the kernel.
    pub fn is_system(self) -> bool {
        self.0 == 0 || self.0 == 4
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

/// Per-process enforcement phase.
///
/// Every newly tracked process enters [`Phase::Aggressive`]. A process that
/// passes the full verification sequence settles in [`Phase::Stable`]; one
/// that keeps getting re-throttled is moved to [`Phase::Persistent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Aggressive,
    Stable,
    Persistent,
}

impl Phase {
    /// Phases that accept thread-creation re-checks.
    pub fn accepts_thread_events(self) -> bool {
        matches!(self, Phase::Stable | Phase::Persistent)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Aggressive => write!(f, "aggressive"),
            Phase::Stable => write!(f, "stable"),
            Phase::Persistent => write!(f, "persistent"),
        }
    }
}

/// Engine-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Event source healthy; enforcement is event driven.
    #[default]
    Normal,
    /// Event source unhealthy; a periodic full rescan substitutes for events.
    DegradedEventSource,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Normal => write!(f, "normal"),
            OperationMode::DegradedEventSource => write!(f, "degraded_event_source"),
        }
    }
}
