//! In-memory platform for tests.
//!
//! `MockPlatform` models a process table where each process has a scripted
//! throttle state. `force_full_power` clears the throttle; tests call
//! [`MockPlatform::rethrottle`] to simulate the OS re-applying it, and
//! [`MockPlatform::exit`] to kill a process and fire its exit watch.
//!
//! # Example
//!
//! ```ignore
//! let platform = MockPlatform::new()
//!     .with_process(100, 1, "game.exe")
//!     .with_child(101, 100, "helper.exe");
//! platform.rethrottle(100);
//! assert_eq!(platform.force_calls(100), 0);
//! ```

use super::{
    ExitWatch, Platform, PolicyStore, ProcessControl, ProcessEntry, ProcessExit, ProcessGroup,
};
use crossbeam_channel::Sender;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tg_common::{OsError, ProcessId};

#[derive(Debug, Clone)]
struct MockProc {
    /// Bumped on every spawn so handles to a recycled pid go stale.
    instance: u64,
    parent: u32,
    image: String,
    path: String,
    throttled: bool,
    alive: bool,
    foreign_group: bool,
    open_error: Option<OsError>,
    query_error: Option<OsError>,
    force_errors: VecDeque<OsError>,
    force_calls: usize,
    thread_calls: usize,
}

#[derive(Default)]
struct MockState {
    procs: BTreeMap<u32, MockProc>,
    watchers: HashMap<u32, (ProcessExit, Sender<ProcessExit>)>,
    groups: Vec<Arc<Mutex<Vec<u32>>>>,
    group_error: Option<OsError>,
    opens: usize,
    spawned: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable in-memory [`Platform`].
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
    watches_dropped: Arc<AtomicUsize>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running, un-throttled process.
    pub fn with_process(self, pid: u32, parent: u32, image: &str) -> Self {
        self.spawn(pid, parent, image);
        self
    }

    /// Alias of `with_process` that reads better for descendants.
    pub fn with_child(self, pid: u32, parent: u32, image: &str) -> Self {
        self.with_process(pid, parent, image)
    }

    /// Start a process at runtime.
    pub fn spawn(&self, pid: u32, parent: u32, image: &str) {
        let mut state = lock(&self.state);
        state.spawned += 1;
        let instance = state.spawned;
        state.procs.insert(
            pid,
            MockProc {
                instance,
                parent,
                image: image.to_string(),
                path: format!("C:\\Program Files\\Mock\\{image}"),
                throttled: false,
                alive: true,
                foreign_group: false,
                open_error: None,
                query_error: None,
                force_errors: VecDeque::new(),
                force_calls: 0,
                thread_calls: 0,
            },
        );
    }

    fn with_proc<R>(&self, pid: u32, f: impl FnOnce(&mut MockProc) -> R) -> Option<R> {
        lock(&self.state).procs.get_mut(&pid).map(f)
    }

    /// Simulate the OS re-enabling throttling.
    pub fn rethrottle(&self, pid: u32) {
        self.with_proc(pid, |p| p.throttled = true);
    }

    pub fn is_throttled(&self, pid: u32) -> bool {
        self.with_proc(pid, |p| p.throttled).unwrap_or(false)
    }

    /// Mark the process as already inside an externally owned group.
    pub fn set_foreign_group(&self, pid: u32) {
        self.with_proc(pid, |p| p.foreign_group = true);
    }

    pub fn fail_open(&self, pid: u32, err: OsError) {
        self.with_proc(pid, |p| p.open_error = Some(err));
    }

    pub fn fail_query(&self, pid: u32, err: Option<OsError>) {
        self.with_proc(pid, |p| p.query_error = err);
    }

    /// Queue errors returned by the next `force_full_power` calls.
    pub fn fail_force(&self, pid: u32, errors: &[OsError]) {
        self.with_proc(pid, |p| p.force_errors.extend(errors.iter().copied()));
    }

    /// Make group creation fail.
    pub fn fail_groups(&self, err: OsError) {
        lock(&self.state).group_error = Some(err);
    }

    /// Mark dead without notifying, as if the exit notification were lost.
    pub fn kill_silently(&self, pid: u32) {
        self.with_proc(pid, |p| p.alive = false);
    }

    /// Kill the process and fire its exit watch if one is registered.
    pub fn exit(&self, pid: u32) {
        let watcher = {
            let mut state = lock(&self.state);
            if let Some(p) = state.procs.get_mut(&pid) {
                p.alive = false;
            }
            state.watchers.remove(&pid)
        };
        if let Some((exit, tx)) = watcher {
            let _ = tx.send(exit);
        }
    }

    /// Remove a dead process from the table entirely.
    pub fn reap(&self, pid: u32) {
        lock(&self.state).procs.remove(&pid);
    }

    /// Number of override pulses applied to `pid`.
    pub fn force_calls(&self, pid: u32) -> usize {
        self.with_proc(pid, |p| p.force_calls).unwrap_or(0)
    }

    /// Number of per-thread passes applied to `pid`.
    pub fn thread_calls(&self, pid: u32) -> usize {
        self.with_proc(pid, |p| p.thread_calls).unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn has_exit_watch(&self, pid: u32) -> bool {
        lock(&self.state).watchers.contains_key(&pid)
    }

    pub fn watches_dropped(&self) -> usize {
        self.watches_dropped.load(Ordering::SeqCst)
    }

    pub fn group_count(&self) -> usize {
        lock(&self.state).groups.len()
    }

    /// Members of every group created so far.
    pub fn group_members(&self) -> Vec<Vec<u32>> {
        lock(&self.state)
            .groups
            .iter()
            .map(|g| lock(g).clone())
            .collect()
    }

    /// Put `pid` into group number `index` as the OS would for a spawned
    /// descendant.
    pub fn join_group(&self, index: usize, pid: u32) {
        let group = lock(&self.state).groups.get(index).cloned();
        if let Some(group) = group {
            lock(&group).push(pid);
        }
    }
}

struct MockControl {
    pid: u32,
    instance: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    /// The process this handle was opened on, unless the pid was recycled.
    fn with_own<R>(&self, f: impl FnOnce(Option<&mut MockProc>) -> R) -> R {
        let mut state = lock(&self.state);
        f(state
            .procs
            .get_mut(&self.pid)
            .filter(|p| p.instance == self.instance))
    }
}

impl ProcessControl for MockControl {
    fn is_throttled(&self) -> Result<bool, OsError> {
        self.with_own(|p| match p {
            Some(p) if !p.alive => Err(OsError::invalid_handle()),
            Some(p) => match p.query_error {
                Some(err) => Err(err),
                None => Ok(p.throttled),
            },
            None => Err(OsError::invalid_handle()),
        })
    }

    fn force_full_power(&self) -> Result<(), OsError> {
        self.with_own(|p| {
            let p = p.ok_or_else(OsError::invalid_handle)?;
            if !p.alive {
                return Err(OsError::invalid_handle());
            }
            p.force_calls += 1;
            if let Some(err) = p.force_errors.pop_front() {
                return Err(err);
            }
            p.throttled = false;
            Ok(())
        })
    }

    fn is_alive(&self) -> bool {
        self.with_own(|p| p.is_some_and(|p| p.alive))
    }

    fn image_path(&self) -> Option<String> {
        self.with_own(|p| p.map(|p| p.path.clone()))
    }

    fn in_foreign_group(&self) -> bool {
        self.with_own(|p| p.is_some_and(|p| p.foreign_group))
    }
}

struct MockWatch {
    exit: ProcessExit,
    state: Arc<Mutex<MockState>>,
    dropped: Arc<AtomicUsize>,
}

impl ExitWatch for MockWatch {}

impl Drop for MockWatch {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        // a newer watch for a recycled pid stays registered
        if state
            .watchers
            .get(&self.exit.pid.0)
            .is_some_and(|(exit, _)| *exit == self.exit)
        {
            state.watchers.remove(&self.exit.pid.0);
        }
        drop(state);
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockGroup {
    members: Arc<Mutex<Vec<u32>>>,
}

impl ProcessGroup for MockGroup {
    fn assign(&self, pid: ProcessId) -> Result<(), OsError> {
        let mut members = lock(&self.members);
        if !members.contains(&pid.0) {
            members.push(pid.0);
        }
        Ok(())
    }

    fn member_pids(&self, buf: &mut [u32]) -> Result<usize, OsError> {
        let members = lock(&self.members);
        let n = members.len().min(buf.len());
        buf[..n].copy_from_slice(&members[..n]);
        Ok(n)
    }
}

impl Platform for MockPlatform {
    fn open_process(&self, pid: ProcessId) -> Result<Box<dyn ProcessControl>, OsError> {
        let mut state = lock(&self.state);
        state.opens += 1;
        match state.procs.get(&pid.0) {
            Some(p) if !p.alive => Err(OsError::invalid_parameter()),
            Some(p) => match p.open_error {
                Some(err) => Err(err),
                None => Ok(Box::new(MockControl {
                    pid: pid.0,
                    instance: p.instance,
                    state: Arc::clone(&self.state),
                })),
            },
            None => Err(OsError::invalid_parameter()),
        }
    }

    fn watch_exit(
        &self,
        exit: ProcessExit,
        notify: Sender<ProcessExit>,
    ) -> Result<Box<dyn ExitWatch>, OsError> {
        let mut state = lock(&self.state);
        if !state.procs.get(&exit.pid.0).is_some_and(|p| p.alive) {
            return Err(OsError::invalid_parameter());
        }
        state.watchers.insert(exit.pid.0, (exit, notify));
        Ok(Box::new(MockWatch {
            exit,
            state: Arc::clone(&self.state),
            dropped: Arc::clone(&self.watches_dropped),
        }))
    }

    fn create_group(&self) -> Result<Box<dyn ProcessGroup>, OsError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.group_error {
            return Err(err);
        }
        let members = Arc::new(Mutex::new(Vec::new()));
        state.groups.push(Arc::clone(&members));
        Ok(Box::new(MockGroup { members }))
    }

    fn disable_thread_throttling(&self, pid: ProcessId) -> usize {
        self.with_proc(pid.0, |p| {
            p.thread_calls += 1;
            1
        })
        .unwrap_or(0)
    }

    fn snapshot(&self) -> Result<Vec<ProcessEntry>, OsError> {
        Ok(lock(&self.state)
            .procs
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(pid, p)| ProcessEntry {
                pid: ProcessId(*pid),
                parent: ProcessId(p.parent),
                image: p.image.clone(),
            })
            .collect())
    }

    fn image_name(&self, pid: ProcessId) -> Option<String> {
        lock(&self.state)
            .procs
            .get(&pid.0)
            .filter(|p| p.alive)
            .map(|p| p.image.clone())
    }
}

/// A recorded policy-store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCall {
    SetExclusion(String),
    RemoveExclusion(String),
    SetPriority(String),
    RemovePriority(String),
}

#[derive(Default)]
struct PolicyState {
    calls: Vec<PolicyCall>,
    exclusions: HashSet<String>,
    overrides: HashSet<String>,
    fail_writes: Option<OsError>,
}

/// In-memory [`PolicyStore`] that records every call.
#[derive(Clone, Default)]
pub struct MockPolicyStore {
    state: Arc<Mutex<PolicyState>>,
}

impl MockPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PolicyCall> {
        lock(&self.state).calls.clone()
    }

    pub fn set_calls(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| matches!(c, PolicyCall::SetExclusion(_) | PolicyCall::SetPriority(_)))
            .count()
    }

    pub fn has_exclusion(&self, path: &str) -> bool {
        lock(&self.state).exclusions.contains(&path.to_lowercase())
    }

    pub fn has_override(&self, image: &str) -> bool {
        lock(&self.state).overrides.contains(&image.to_lowercase())
    }

    /// Pre-populate entries as if left behind by a crashed run.
    pub fn seed(&self, path: &str, image: &str) {
        let mut state = lock(&self.state);
        state.exclusions.insert(path.to_lowercase());
        state.overrides.insert(image.to_lowercase());
    }

    pub fn fail_writes(&self, err: Option<OsError>) {
        lock(&self.state).fail_writes = err;
    }

    pub fn is_empty(&self) -> bool {
        let state = lock(&self.state);
        state.exclusions.is_empty() && state.overrides.is_empty()
    }
}

impl PolicyStore for MockPolicyStore {
    fn set_throttle_exclusion(&self, path: &str) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        state.calls.push(PolicyCall::SetExclusion(path.to_string()));
        if let Some(err) = state.fail_writes {
            return Err(err);
        }
        state.exclusions.insert(path.to_lowercase());
        Ok(())
    }

    fn remove_throttle_exclusion(&self, path: &str) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        state.calls.push(PolicyCall::RemoveExclusion(path.to_string()));
        state.exclusions.remove(&path.to_lowercase());
        Ok(())
    }

    fn set_priority_override(&self, image: &str) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        state.calls.push(PolicyCall::SetPriority(image.to_string()));
        if let Some(err) = state.fail_writes {
            return Err(err);
        }
        state.overrides.insert(image.to_lowercase());
        Ok(())
    }

    fn remove_priority_override(&self, image: &str) -> Result<(), OsError> {
        let mut state = lock(&self.state);
        state.calls.push(PolicyCall::RemovePriority(image.to_string()));
        state.overrides.remove(&image.to_lowercase());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_clears_throttle_and_counts() {
        let platform = MockPlatform::new().with_process(10, 1, "a.exe");
        let control = platform.open_process(ProcessId(10)).unwrap();
        platform.rethrottle(10);
        assert_eq!(control.is_throttled(), Ok(true));
        control.force_full_power().unwrap();
        assert_eq!(control.is_throttled(), Ok(false));
        assert_eq!(platform.force_calls(10), 1);
    }

    #[test]
    fn test_exit_fires_watch_and_invalidates_handle() {
        let platform = MockPlatform::new().with_process(10, 1, "a.exe");
        let control = platform.open_process(ProcessId(10)).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let exit = ProcessExit {
            pid: ProcessId(10),
            generation: 7,
        };
        let watch = platform.watch_exit(exit, tx).unwrap();
        platform.exit(10);
        assert_eq!(rx.try_recv(), Ok(exit));
        assert!(!control.is_alive());
        assert_eq!(control.is_throttled(), Err(OsError::invalid_handle()));
        drop(watch);
        assert_eq!(platform.watches_dropped(), 1);
    }

    #[test]
    fn test_group_buffer_is_bounded() {
        let platform = MockPlatform::new();
        let group = platform.create_group().unwrap();
        for pid in 1..=10 {
            group.assign(ProcessId(pid)).unwrap();
        }
        let mut buf = [0u32; 4];
        assert_eq!(group.member_pids(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_policy_store_records_calls() {
        let store = MockPolicyStore::new();
        store.set_throttle_exclusion("C:\\A.exe").unwrap();
        store.set_priority_override("a.exe").unwrap();
        assert!(store.has_exclusion("c:\\a.exe"));
        store.remove_throttle_exclusion("C:\\A.exe").unwrap();
        store.remove_priority_override("a.exe").unwrap();
        store.remove_priority_override("a.exe").unwrap();
        assert!(store.is_empty());
        assert_eq!(store.set_calls(), 2);
        assert_eq!(store.calls().len(), 5);
    }
}
