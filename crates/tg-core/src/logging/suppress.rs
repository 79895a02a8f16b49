//! Rate limiting for repeated error records.

use std::collections::HashMap;

/// Entries older than the window are pruned once the map grows past this.
const PRUNE_THRESHOLD: usize = 512;

/// Lets the first error for a (pid, code) pair through and drops repeats
/// for `window_ms`.
#[derive(Debug)]
pub struct ErrorLogSuppressor {
    window_ms: u64,
    last: HashMap<(u32, u32), u64>,
    suppressed: u64,
}

impl ErrorLogSuppressor {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last: HashMap::new(),
            suppressed: 0,
        }
    }

    /// Whether an error for `(pid, code)` at `now_ms` should be logged.
    pub fn should_log(&mut self, pid: u32, code: u32, now_ms: u64) -> bool {
        if self.last.len() > PRUNE_THRESHOLD {
            let window = self.window_ms;
            self.last.retain(|_, t| now_ms.saturating_sub(*t) < window);
        }
        match self.last.get(&(pid, code)) {
            Some(&t) if now_ms.saturating_sub(t) < self.window_ms => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last.insert((pid, code), now_ms);
                true
            }
        }
    }

    /// Forget a pid, e.g. after it exits.
    pub fn forget(&mut self, pid: u32) {
        self.last.retain(|(p, _), _| *p != pid);
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
