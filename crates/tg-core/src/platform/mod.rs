//! OS capability seam.
//!
//! The engine never calls the OS directly. Everything it needs (open a
//! process, query and clear power throttling, watch for exit, manage
//! process groups, write persistent policy entries) goes through the traits
//! here so the same dispatcher runs against Windows in production and an
//! in-memory mock in tests.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
#[cfg(target_os = "windows")]
pub mod windows;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tg_common::{OsError, ProcessId};

/// One row of a process-table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: ProcessId,
    pub parent: ProcessId,
    /// Bare image name as reported by the OS (case preserved).
    pub image: String,
}

/// Exit notification for one tracked lifetime of a pid.
///
/// Pids are recycled, so the notification also carries the generation the
/// watch was registered for; a notification for an older generation must
/// not remove a newer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessExit {
    pub pid: ProcessId,
    pub generation: u64,
}

/// Exclusively owned control handle for one process.
///
/// Opened with the minimum rights needed to query and set power state;
/// closed when dropped.
pub trait ProcessControl: Send {
    /// Whether execution-speed throttling is currently in effect.
    fn is_throttled(&self) -> Result<bool, OsError>;

    /// Force the process out of background/efficiency mode and raise its
    /// priority class. One call is one "override pulse".
    fn force_full_power(&self) -> Result<(), OsError>;

    /// Exit-code based liveness check.
    fn is_alive(&self) -> bool;

    /// Full executable path, if it can be resolved.
    fn image_path(&self) -> Option<String>;

    /// Whether the process already belongs to a group we did not create.
    fn in_foreign_group(&self) -> bool;
}

/// Registration of an exit notification.
///
/// Dropping it unregisters the wait and blocks until a notification
/// callback that is already running has returned.
pub trait ExitWatch: Send {}

/// An OS process-grouping object (a job object on Windows).
pub trait ProcessGroup: Send {
    /// Assign a process to the group.
    fn assign(&self, pid: ProcessId) -> Result<(), OsError>;

    /// Fill `buf` with member pids and return how many were written.
    /// Members beyond the buffer's capacity are silently omitted.
    fn member_pids(&self, buf: &mut [u32]) -> Result<usize, OsError>;
}

/// Process-level OS capabilities.
pub trait Platform: Send + Sync {
    /// Open a control handle for `pid`.
    fn open_process(&self, pid: ProcessId) -> Result<Box<dyn ProcessControl>, OsError>;

    /// Send `exit` on `notify` once process `exit.pid` exits.
    fn watch_exit(
        &self,
        exit: ProcessExit,
        notify: Sender<ProcessExit>,
    ) -> Result<Box<dyn ExitWatch>, OsError>;

    /// Create a group whose members may break away silently.
    fn create_group(&self) -> Result<Box<dyn ProcessGroup>, OsError>;

    /// Clear per-thread throttling on every thread of `pid`. Returns the
    /// number of threads updated.
    fn disable_thread_throttling(&self, pid: ProcessId) -> usize;

    /// Snapshot of all running processes.
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, OsError>;

    /// Bare image name of a running process.
    fn image_name(&self, pid: ProcessId) -> Option<String>;
}

/// System-wide persistent policy entries keyed by executable.
///
/// Removal of an entry that does not exist is success.
pub trait PolicyStore: Send + Sync {
    /// Exempt the executable at `path` from power throttling.
    fn set_throttle_exclusion(&self, path: &str) -> Result<(), OsError>;
    fn remove_throttle_exclusion(&self, path: &str) -> Result<(), OsError>;

    /// Pin the CPU priority class for `image`.
    fn set_priority_override(&self, image: &str) -> Result<(), OsError>;
    fn remove_priority_override(&self, image: &str) -> Result<(), OsError>;
}

/// The platform and policy store for the host OS.
#[cfg(target_os = "windows")]
pub fn native() -> (Arc<dyn Platform>, Arc<dyn PolicyStore>) {
    (
        Arc::new(windows::WindowsPlatform::new()),
        Arc::new(windows::RegistryPolicyStore::new()),
    )
}

/// The platform and policy store for the host OS.
#[cfg(not(target_os = "windows"))]
pub fn native() -> (Arc<dyn Platform>, Arc<dyn PolicyStore>) {
    (Arc::new(Unsupported), Arc::new(Unsupported))
}

/// Fallback for hosts without power-throttling controls: every call fails
/// with [`OsError::unsupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl Platform for Unsupported {
    fn open_process(&self, _pid: ProcessId) -> Result<Box<dyn ProcessControl>, OsError> {
        Err(OsError::unsupported())
    }

    fn watch_exit(
        &self,
        _exit: ProcessExit,
        _notify: Sender<ProcessExit>,
    ) -> Result<Box<dyn ExitWatch>, OsError> {
        Err(OsError::unsupported())
    }

    fn create_group(&self) -> Result<Box<dyn ProcessGroup>, OsError> {
        Err(OsError::unsupported())
    }

    fn disable_thread_throttling(&self, _pid: ProcessId) -> usize {
        0
    }

    fn snapshot(&self) -> Result<Vec<ProcessEntry>, OsError> {
        Err(OsError::unsupported())
    }

    fn image_name(&self, _pid: ProcessId) -> Option<String> {
        None
    }
}

impl PolicyStore for Unsupported {
    fn set_throttle_exclusion(&self, _path: &str) -> Result<(), OsError> {
        Err(OsError::unsupported())
    }

    fn remove_throttle_exclusion(&self, _path: &str) -> Result<(), OsError> {
        Ok(())
    }

    fn set_priority_override(&self, _image: &str) -> Result<(), OsError> {
        Err(OsError::unsupported())
    }

    fn remove_priority_override(&self, _image: &str) -> Result<(), OsError> {
        Ok(())
    }
}

/// Treat "more data available" from a fixed-buffer query as success: the
/// buffer holds as many entries as fit. Returns whether it was truncated.
pub(crate) fn accept_truncated(result: Result<(), OsError>) -> Result<bool, OsError> {
    match result {
        Ok(()) => Ok(false),
        Err(err) if err.is_more_data() => Ok(true),
        Err(err) => Err(err),
    }
}

/// Whether the host supports enforcement at all.
pub fn is_supported() -> bool {
    cfg!(target_os = "windows")
}
