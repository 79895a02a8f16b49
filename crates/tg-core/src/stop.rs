//! Stop requests for the foreground service.
//!
//! `tgd run` waits on a [`StopSignal`]. Any number of [`StopHandle`]s feed
//! it: the console-control/termination handler, the optional stdin reader,
//! tests. The first request wins; later ones are dropped.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::io::BufRead;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why the service stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Ctrl-C, Ctrl-Break, console close or SIGTERM.
    Signal,
    /// stdin reached EOF or failed.
    StdinClosed,
    /// A `quit` line on stdin.
    Quit,
    /// `--duration-secs` elapsed.
    Elapsed,
    /// Every handle was dropped without a request.
    Abandoned,
}

/// Cloneable sender side of a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<StopReason>,
}

impl StopHandle {
    /// Request a stop. Returns false if a stop was already pending.
    pub fn request(&self, reason: StopReason) -> bool {
        match self.tx.try_send(reason) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                debug!(?reason, "stop already requested");
                false
            }
        }
    }
}

/// Receiver side; consumed by [`StopSignal::wait`].
#[derive(Debug)]
pub struct StopSignal {
    rx: Receiver<StopReason>,
}

impl StopSignal {
    pub fn new() -> (StopHandle, StopSignal) {
        let (tx, rx) = bounded(1);
        (StopHandle { tx }, StopSignal { rx })
    }

    /// Block until a stop is requested or `limit` elapses.
    pub fn wait(self, limit: Option<Duration>) -> StopReason {
        let reason = match limit {
            Some(limit) => match self.rx.recv_timeout(limit) {
                Ok(reason) => reason,
                Err(RecvTimeoutError::Timeout) => StopReason::Elapsed,
                Err(RecvTimeoutError::Disconnected) => StopReason::Abandoned,
            },
            None => self.rx.recv().unwrap_or(StopReason::Abandoned),
        };
        info!(?reason, "stop requested");
        reason
    }
}

/// Route console-control and termination signals to `handle`.
///
/// Can be installed once per process.
pub fn install_signal_handler(handle: StopHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        handle.request(StopReason::Signal);
    })
}

/// Read lines until EOF or `quit`, then request a stop.
pub fn watch_lines<R: BufRead>(input: R, handle: &StopHandle) -> StopReason {
    let mut reason = StopReason::StdinClosed;
    for line in input.lines() {
        match line {
            Ok(l) if l.trim().eq_ignore_ascii_case("quit") => {
                reason = StopReason::Quit;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "stdin read failed, stopping");
                break;
            }
        }
    }
    handle.request(reason);
    reason
}
