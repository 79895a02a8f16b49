//! Process-tree grouping tracker.
//!
//! Each un-sandboxed root target is placed in a group we own so that its
//! descendants can be enumerated even when the event source missed their
//! creation. Roots already inside someone else's group (browser sandboxes,
//! app containers) are left alone and enforced directly.

use crate::platform::{Platform, ProcessControl, ProcessGroup};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tg_common::{OsError, ProcessId};
use tracing::{debug, trace, warn};

/// Default member-buffer capacity per refresh.
pub const MAX_GROUP_PIDS: usize = 1024;

/// How a root ended up relative to grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Assigned to a fresh group we own.
    Assigned,
    /// Already in an external group; grouping skipped.
    ForeignGroup,
    /// Creating or assigning the group failed.
    Failed(OsError),
}

impl Attachment {
    pub fn in_group(self) -> bool {
        matches!(self, Attachment::Assigned)
    }

    /// True when grouping was skipped or failed and the root relies on
    /// direct enforcement only.
    pub fn assignment_failed(self) -> bool {
        !self.in_group()
    }
}

struct GroupEntry {
    group: Box<dyn ProcessGroup>,
    created_by_us: bool,
}

/// A member pid discovered inside a root's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovered {
    pub root: ProcessId,
    pub pid: ProcessId,
}

/// Owner of every group created for root targets.
pub struct GroupingTracker {
    platform: Arc<dyn Platform>,
    groups: Mutex<HashMap<ProcessId, GroupEntry>>,
    buffer: Mutex<Box<[u32]>>,
}

impl std::fmt::Debug for GroupingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupingTracker")
            .field("groups", &self.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GroupingTracker {
    pub fn new(platform: Arc<dyn Platform>, capacity: usize) -> Self {
        Self {
            platform,
            groups: Mutex::new(HashMap::new()),
            buffer: Mutex::new(vec![0u32; capacity.max(1)].into_boxed_slice()),
        }
    }

    /// Put `root` into a new group unless it already lives in a foreign one.
    pub fn attach(&self, root: ProcessId, control: &dyn ProcessControl) -> Attachment {
        if lock(&self.groups).contains_key(&root) {
            return Attachment::Assigned;
        }
        if control.in_foreign_group() {
            debug!(pid = %root, "root already in an external group, using direct enforcement");
            return Attachment::ForeignGroup;
        }

        let group = match self.platform.create_group() {
            Ok(g) => g,
            Err(err) => {
                warn!(pid = %root, error = %err, "group creation failed");
                return Attachment::Failed(err);
            }
        };
        if let Err(err) = group.assign(root) {
            debug!(pid = %root, error = %err, "group assignment failed");
            return Attachment::Failed(err);
        }

        lock(&self.groups).insert(
            root,
            GroupEntry {
                group,
                created_by_us: true,
            },
        );
        trace!(pid = %root, "root assigned to group");
        Attachment::Assigned
    }

    /// Enumerate members of every owned group and return those for which
    /// `is_tracked` is false.
    ///
    /// Holds the group lock only while copying pids out of the fixed
    /// buffer; name resolution and enforcement belong to the caller.
    pub fn collect_untracked(&self, is_tracked: impl Fn(ProcessId) -> bool) -> Vec<Discovered> {
        let mut found = Vec::new();
        let groups = lock(&self.groups);
        if groups.is_empty() {
            return found;
        }
        let mut buffer = lock(&self.buffer);

        for (root, entry) in groups.iter() {
            let n = match entry.group.member_pids(&mut buffer) {
                Ok(n) => n,
                Err(err) => {
                    trace!(root = %root, error = %err, "group query failed");
                    continue;
                }
            };
            for &raw in &buffer[..n] {
                let pid = ProcessId(raw);
                if pid != *root && !is_tracked(pid) {
                    found.push(Discovered { root: *root, pid });
                }
            }
        }
        found
    }

    /// Close the group for `root`, if any.
    pub fn release(&self, root: ProcessId) -> bool {
        lock(&self.groups).remove(&root).is_some()
    }

    /// Close every group. Returns how many were ours.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.groups).drain().collect();
        drained.iter().filter(|(_, e)| e.created_by_us).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.groups).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, root: ProcessId) -> bool {
        lock(&self.groups).contains_key(&root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    #[test]
    fn test_attach_creates_group_and_assigns_root() {
        let mock = MockPlatform::new().with_process(100, 1, "game.exe");
        let tracker = GroupingTracker::new(Arc::new(mock.clone()), 16);
        let control = mock.open_process(ProcessId(100)).unwrap();

        assert_eq!(tracker.attach(ProcessId(100), control.as_ref()), Attachment::Assigned);
        assert_eq!(mock.group_members(), vec![vec![100]]);
        // second attach is a no-op
        assert_eq!(tracker.attach(ProcessId(100), control.as_ref()), Attachment::Assigned);
        assert_eq!(mock.group_count(), 1);
    }

    #[test]
    fn test_foreign_group_skips_assignment() {
        let mock = MockPlatform::new().with_process(100, 1, "browser.exe");
        mock.set_foreign_group(100);
        let tracker = GroupingTracker::new(Arc::new(mock.clone()), 16);
        let control = mock.open_process(ProcessId(100)).unwrap();

        let attachment = tracker.attach(ProcessId(100), control.as_ref());
        assert_eq!(attachment, Attachment::ForeignGroup);
        assert!(attachment.assignment_failed());
        assert_eq!(mock.group_count(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_collect_untracked_skips_root_and_tracked() {
        let mock = MockPlatform::new()
            .with_process(100, 1, "game.exe")
            .with_child(101, 100, "helper.exe")
            .with_child(102, 100, "worker.exe");
        let tracker = GroupingTracker::new(Arc::new(mock.clone()), 16);
        let control = mock.open_process(ProcessId(100)).unwrap();
        tracker.attach(ProcessId(100), control.as_ref());
        mock.join_group(0, 101);
        mock.join_group(0, 102);

        let found = tracker.collect_untracked(|pid| pid == ProcessId(101));
        assert_eq!(
            found,
            vec![Discovered {
                root: ProcessId(100),
                pid: ProcessId(102)
            }]
        );
    }

    #[test]
    fn test_buffer_capacity_bounds_enumeration() {
        let mock = MockPlatform::new().with_process(100, 1, "game.exe");
        let tracker = GroupingTracker::new(Arc::new(mock.clone()), 3);
        let control = mock.open_process(ProcessId(100)).unwrap();
        tracker.attach(ProcessId(100), control.as_ref());
        for pid in 200..210 {
            mock.join_group(0, pid);
        }
        // root plus two members fit
        assert_eq!(tracker.collect_untracked(|_| false).len(), 2);
    }

    #[test]
    fn test_group_failure_reported() {
        let mock = MockPlatform::new().with_process(100, 1, "game.exe");
        mock.fail_groups(OsError::access_denied());
        let tracker = GroupingTracker::new(Arc::new(mock.clone()), 16);
        let control = mock.open_process(ProcessId(100)).unwrap();
        assert_eq!(
            tracker.attach(ProcessId(100), control.as_ref()),
            Attachment::Failed(OsError::access_denied())
        );
    }

    #[test]
    fn test_release_and_clear() {
        let mock = MockPlatform::new()
            .with_process(100, 1, "a.exe")
            .with_process(200, 1, "b.exe");
        let tracker = GroupingTracker::new(Arc::new(mock.clone()), 16);
        for pid in [100, 200] {
            let control = mock.open_process(ProcessId(pid)).unwrap();
            tracker.attach(ProcessId(pid), control.as_ref());
        }
        assert!(tracker.release(ProcessId(100)));
        assert!(!tracker.release(ProcessId(100)));
        assert_eq!(tracker.clear(), 1);
        assert!(tracker.is_empty());
    }
}
