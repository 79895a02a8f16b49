//! Change notification for the config file's directory.

use crossbeam_channel::Sender;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::Path;
use tg_config::CONFIG_FILENAME;
use tracing::{debug, warn};

/// Signals `tx` whenever the config file in the watched directory is
/// touched. Dropping the watcher stops notifications.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher").finish_non_exhaustive()
    }
}

/// Whether an event concerns the config file.
pub fn is_config_event(event: &Event) -> bool {
    event.paths.iter().any(|path| {
        path.file_name()
            .is_some_and(|name| name.eq_ignore_ascii_case(CONFIG_FILENAME))
    })
}

impl ConfigWatcher {
    pub fn new(dir: &Path, tx: Sender<()>) -> notify::Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_config_event(&event) {
                    // a full slot already means "changed"
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "config watch error"),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "watching config directory");
        Ok(Self { _watcher: watcher })
    }
}
