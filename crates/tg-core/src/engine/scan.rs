//! Snapshot scans and target-set reconciliation.

use super::dispatch::Dispatcher;
use crate::platform::ProcessEntry;
use std::collections::{HashMap, HashSet, VecDeque};
use tg_common::{normalize_image_name, OsError, ProcessId};
use tracing::{debug, info};

/// What a reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub removed: usize,
    pub added: usize,
}

impl Dispatcher {
    /// Enforce every running target as a root, then every descendant of a
    /// tracked process as a child. Returns how many pids were added.
    pub fn initial_scan(&mut self, targets: &HashSet<String>) -> Result<usize, OsError> {
        let snapshot = self.core.platform.snapshot()?;
        let before = self.table.len();

        for entry in &snapshot {
            let image = normalize_image_name(&entry.image);
            if targets.contains(&image) {
                self.enforce(entry.pid, entry.parent, &image, None);
            }
        }

        let mut children: HashMap<ProcessId, Vec<&ProcessEntry>> = HashMap::new();
        for entry in &snapshot {
            if entry.pid != entry.parent {
                children.entry(entry.parent).or_default().push(entry);
            }
        }

        let mut queue: VecDeque<(ProcessId, ProcessId)> =
            self.table.iter().map(|p| (p.pid, p.root)).collect();
        let mut visited: HashSet<ProcessId> = queue.iter().map(|(pid, _)| *pid).collect();
        while let Some((pid, root)) = queue.pop_front() {
            let Some(kids) = children.get(&pid) else {
                continue;
            };
            for kid in kids {
                if !visited.insert(kid.pid) {
                    continue;
                }
                if self.enforce(kid.pid, pid, &kid.image, Some(root)) {
                    queue.push_back((kid.pid, root));
                }
            }
        }

        let added = self.table.len().saturating_sub(before);
        debug!(scanned = snapshot.len(), added, "snapshot scan complete");
        Ok(added)
    }

    /// Bring the tracked set in line with a new target set.
    ///
    /// Roots whose name is no longer a target are dropped. A child is
    /// dropped only when its root is gone and its own name is not a target.
    /// Persistent policies are left in place.
    pub fn reconcile(&mut self, targets: &HashSet<String>) -> ReconcileOutcome {
        let valid_roots: HashSet<ProcessId> = self
            .table
            .iter()
            .filter(|p| !p.is_child && targets.contains(&p.image))
            .map(|p| p.pid)
            .collect();

        let doomed: Vec<ProcessId> = self
            .table
            .iter()
            .filter(|p| {
                if p.is_child {
                    !valid_roots.contains(&p.root) && !targets.contains(&p.image)
                } else {
                    !valid_roots.contains(&p.pid)
                }
            })
            .map(|p| p.pid)
            .collect();

        let mut outcome = ReconcileOutcome::default();
        for pid in doomed {
            if self.remove(pid) {
                outcome.removed += 1;
            }
        }

        outcome.added = match self.initial_scan(targets) {
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "rescan after reconciliation failed");
                0
            }
        };
        info!(
            removed = outcome.removed,
            added = outcome.added,
            tracked = self.table.len(),
            "targets reconciled"
        );
        outcome
    }
}
