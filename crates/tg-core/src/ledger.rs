//! Durable policy ledger.
//!
//! Records every system-wide policy change (throttle exclusion by path,
//! priority override by image name) in a small manifest so it can be undone
//! after an unclean shutdown:
//!
//! ```text
//! ; throttle-guard applied policies
//! [AppliedPolicies]
//! game.exe=C:\Games\Game.exe
//! ```
//!
//! Ordering contract: the manifest entry is written before the OS policy
//! is touched. A crash in between leaves an entry whose removal is a no-op,
//! never an applied policy nobody remembers.

use crate::platform::PolicyStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tg_common::OsError;
use tg_config::{IniDocument, IniSection};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MANIFEST_FILENAME: &str = "applied-policies.ini";
const SECTION: &str = "AppliedPolicies";

/// Ledger failures. Manifest failures never block enforcement; they are
/// returned so the caller can log them.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error on manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("policy store rejected {image}: {source}")]
    Store {
        image: String,
        #[source]
        source: OsError,
    },

    #[error("{failed} of {total} policies could not be removed")]
    Incomplete { failed: usize, total: usize },
}

impl From<LedgerError> for tg_common::Error {
    fn from(err: LedgerError) -> Self {
        tg_common::Error::Ledger(err.to_string())
    }
}

/// Result of [`PolicyLedger::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

/// In-memory mirror of the manifest plus the store that applies policies.
pub struct PolicyLedger {
    store: Arc<dyn PolicyStore>,
    manifest: PathBuf,
    entries: BTreeMap<String, String>,
    /// Images whose store writes succeeded in this process. Entries loaded
    /// from an earlier run are not in here: that run may have crashed
    /// between recording and writing.
    written: BTreeSet<String>,
}

impl std::fmt::Debug for PolicyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyLedger")
            .field("manifest", &self.manifest)
            .field("entries", &self.entries)
            .field("written", &self.written)
            .finish()
    }
}

impl PolicyLedger {
    /// Open the ledger in `base_dir`, loading any existing manifest first so
    /// memory and disk agree before a new policy is applied.
    pub fn open(base_dir: &Path, store: Arc<dyn PolicyStore>) -> Self {
        let mut ledger = Self {
            store,
            manifest: base_dir.join(MANIFEST_FILENAME),
            entries: BTreeMap::new(),
            written: BTreeSet::new(),
        };
        match ledger.load() {
            Ok(0) => {}
            Ok(n) => info!(entries = n, "policy ledger: loaded manifest from previous run"),
            Err(e) => warn!(error = %e, "policy ledger: manifest unreadable, starting empty"),
        }
        ledger
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest
    }

    /// Merge manifest entries into memory. A missing manifest is normal.
    pub fn load(&mut self) -> Result<usize, LedgerError> {
        let content = match std::fs::read_to_string(&self.manifest) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(LedgerError::Manifest {
                    path: self.manifest.clone(),
                    source,
                })
            }
        };
        let doc = IniDocument::parse(&content);
        let mut loaded = 0;
        if let Some(section) = doc.section(SECTION) {
            for (image, path) in &section.entries {
                if path.is_empty() {
                    continue;
                }
                self.entries
                    .entry(image.to_ascii_lowercase())
                    .or_insert_with(|| path.clone());
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    fn save(&self) -> Result<(), LedgerError> {
        let mut section = IniSection::new(SECTION);
        for (image, path) in &self.entries {
            section.push(image.clone(), path.clone());
        }
        let mut doc = IniDocument::default();
        doc.push_section(section);
        let text = doc.render(&[
            "throttle-guard applied policies",
            "Do not edit: used to undo policy changes after an unclean shutdown",
        ]);

        let tmp = self.manifest.with_extension("ini.tmp");
        let io_err = |source| LedgerError::Manifest {
            path: self.manifest.clone(),
            source,
        };
        if let Some(parent) = self.manifest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&tmp, text).map_err(io_err)?;
        std::fs::rename(&tmp, &self.manifest).map_err(io_err)
    }

    fn delete_manifest(&self) -> Result<(), LedgerError> {
        match std::fs::remove_file(&self.manifest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LedgerError::Manifest {
                path: self.manifest.clone(),
                source,
            }),
        }
    }

    /// Record and apply both policies for a root target.
    ///
    /// Idempotent per image name once the store writes have succeeded. A
    /// rejected write keeps the entry recorded, so cleanup still visits it,
    /// and the next `apply` for the image tries the store again.
    pub fn apply(&mut self, image: &str, path: &str) -> Result<ApplyOutcome, LedgerError> {
        let key = image.to_ascii_lowercase();
        if self.written.contains(&key) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        match self.entries.get(&key) {
            Some(recorded) if recorded == path => {}
            previous => {
                if let Some(old_path) = previous {
                    // the image moved; its old exclusion would otherwise leak
                    if let Err(e) = self.store.remove_throttle_exclusion(old_path) {
                        debug!(image = %key, error = %e, "stale exclusion not removed");
                    }
                }
                self.entries.insert(key.clone(), path.to_string());
                if let Err(e) = self.save() {
                    warn!(image = %key, error = %e, "policy ledger: manifest write failed, applying anyway");
                }
            }
        }

        self.store
            .set_throttle_exclusion(path)
            .map_err(|source| LedgerError::Store {
                image: key.clone(),
                source,
            })?;
        self.store
            .set_priority_override(&key)
            .map_err(|source| LedgerError::Store {
                image: key.clone(),
                source,
            })?;

        info!(image = %key, path, "policy applied");
        self.written.insert(key);
        Ok(ApplyOutcome::Applied)
    }

    fn reverse(&self, image: &str, path: &str) -> Result<(), LedgerError> {
        let store_err = |source| LedgerError::Store {
            image: image.to_string(),
            source,
        };
        self.store.remove_throttle_exclusion(path).map_err(store_err)?;
        self.store.remove_priority_override(image).map_err(store_err)
    }

    /// Reverse one target's policies and drop its entry.
    pub fn remove_one(&mut self, image: &str, path: &str) -> Result<(), LedgerError> {
        let key = image.to_ascii_lowercase();
        self.reverse(&key, path)?;
        self.written.remove(&key);
        if self.entries.remove(&key).is_some() {
            if self.entries.is_empty() {
                self.delete_manifest()?;
            } else {
                self.save()?;
            }
            debug!(image = %key, "policy removed");
        }
        Ok(())
    }

    /// Reverse every recorded policy, including entries only present in
    /// the manifest, then delete the manifest.
    ///
    /// Entries whose removal fails are kept (in memory and on disk) for the
    /// next attempt.
    pub fn remove_all(&mut self) -> Result<usize, LedgerError> {
        if let Err(e) = self.load() {
            warn!(error = %e, "policy ledger: manifest unreadable during cleanup");
        }
        let total = self.entries.len();
        let mut failed = BTreeMap::new();

        for (image, path) in std::mem::take(&mut self.entries) {
            if let Err(e) = self.reverse(&image, &path) {
                warn!(image = %image, error = %e, "policy removal failed");
                failed.insert(image, path);
            }
        }

        let removed = total - failed.len();
        self.entries = failed;
        self.written.retain(|image| self.entries.contains_key(image));
        if self.entries.is_empty() {
            self.delete_manifest()?;
        } else {
            self.save()?;
            return Err(LedgerError::Incomplete {
                failed: self.entries.len(),
                total,
            });
        }
        if removed > 0 {
            info!(removed, "policy ledger: all policies removed");
        }
        Ok(removed)
    }

    pub fn is_applied(&self, image: &str) -> bool {
        self.entries.contains_key(&image.to_ascii_lowercase())
    }

    /// Recorded image names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
