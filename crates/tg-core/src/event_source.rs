//! Process and thread creation events.
//!
//! An [`EventSource`] pushes into an [`EventSink`]. The sink never blocks:
//! both entry points use `try_send` and count drops, so they are safe to
//! call from an OS callback thread.

use crate::clock::Clock;
use crate::engine::request::{EnforcementRequest, ProcessStart};
use crate::engine::shared::{bump, EngineShared};
use crate::platform::Platform;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tg_common::{OsError, ProcessId};
use tracing::{debug, trace, warn};

/// A source is unhealthy once it has seen events and then gone quiet
/// for longer than this.
pub const STARVATION_MS: u64 = 60_000;

#[derive(Error, Debug)]
pub enum EventSourceError {
    #[error("event source not started")]
    NotStarted,

    #[error("event source already running")]
    AlreadyRunning,

    #[error("failed to spawn event thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("event session failed: {0}")]
    Session(#[from] OsError),
}

/// Non-blocking entry points for event producers.
#[derive(Clone)]
pub struct EventSink {
    starts: Sender<ProcessStart>,
    requests: Sender<EnforcementRequest>,
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

impl EventSink {
    pub fn new(
        starts: Sender<ProcessStart>,
        requests: Sender<EnforcementRequest>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            starts,
            requests,
            shared,
        }
    }

    /// Report a new process. Returns false if the event was dropped.
    pub fn process_started(&self, pid: ProcessId, parent: ProcessId, image: &str) -> bool {
        let event = ProcessStart {
            pid,
            parent,
            image: image.to_string(),
        };
        if self.starts.try_send(event).is_err() {
            bump(&self.shared.stats.dropped_requests);
            return false;
        }
        true
    }

    /// Report a new thread in `pid`.
    ///
    /// Only tracked processes in a phase that re-checks on thread creation
    /// produce a request; everything else is filtered here.
    pub fn thread_started(&self, pid: ProcessId) -> bool {
        let wanted = self
            .shared
            .index
            .phase(pid)
            .is_some_and(|phase| phase.accepts_thread_events());
        if !wanted {
            return false;
        }
        if self
            .requests
            .try_send(EnforcementRequest::thread_event(pid))
            .is_err()
        {
            bump(&self.shared.stats.dropped_requests);
            return false;
        }
        true
    }
}

/// A producer of process and thread events.
pub trait EventSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begin delivering events to `sink`.
    fn start(&self, sink: EventSink) -> Result<(), EventSourceError>;

    /// Stop delivering events. Blocks until any delivery thread has exited.
    fn stop(&self);

    /// Stop and start again with the sink from the last `start`.
    fn restart(&self) -> Result<(), EventSourceError>;

    fn is_healthy(&self) -> bool;

    /// Events delivered since construction.
    fn event_count(&self) -> u64;
}

/// Liveness bookkeeping shared by the provided sources.
#[derive(Debug, Default)]
pub struct SourceHealth {
    running: AtomicBool,
    session_error: AtomicBool,
    events: AtomicU64,
    /// Clock time of the last event or heartbeat; 0 means none yet.
    last_activity_ms: AtomicU64,
}

impl SourceHealth {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        if running {
            self.session_error.store(false, Ordering::SeqCst);
            self.last_activity_ms.store(0, Ordering::SeqCst);
        }
    }

    pub fn set_session_error(&self, failed: bool) {
        self.session_error.store(failed, Ordering::SeqCst);
    }

    pub fn record_event(&self, now_ms: u64) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.heartbeat(now_ms);
    }

    /// Activity that proves the source is alive without being an event.
    pub fn heartbeat(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms.max(1), Ordering::SeqCst);
    }

    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self, now_ms: u64) -> bool {
        if !self.running.load(Ordering::SeqCst) || self.session_error.load(Ordering::SeqCst) {
            return false;
        }
        match self.last_activity_ms.load(Ordering::SeqCst) {
            0 => true,
            last => now_ms.saturating_sub(last) <= STARVATION_MS,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Poller {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Polling source that diffs process-table snapshots.
///
/// The first snapshot is a baseline and produces no events; processes that
/// were already running are the initial scan's job.
pub struct SnapshotEventSource {
    platform: Arc<dyn Platform>,
    clock: Arc<dyn Clock>,
    poll_ms: u64,
    health: Arc<SourceHealth>,
    sink: Mutex<Option<EventSink>>,
    poller: Mutex<Option<Poller>>,
}

impl std::fmt::Debug for SnapshotEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEventSource")
            .field("poll_ms", &self.poll_ms)
            .field("events", &self.health.event_count())
            .finish()
    }
}

/// Poll failures in a row before the session is flagged.
const MAX_POLL_FAILURES: u32 = 3;

impl SnapshotEventSource {
    pub fn new(platform: Arc<dyn Platform>, clock: Arc<dyn Clock>, poll_ms: u64) -> Self {
        Self {
            platform,
            clock,
            poll_ms: poll_ms.max(10),
            health: Arc::new(SourceHealth::default()),
            sink: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    fn spawn(&self, sink: EventSink) -> Result<Poller, EventSourceError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let platform = Arc::clone(&self.platform);
        let clock = Arc::clone(&self.clock);
        let health = Arc::clone(&self.health);
        let interval = Duration::from_millis(self.poll_ms);

        let handle = thread::Builder::new()
            .name("tg-events".to_string())
            .spawn(move || poll_loop(platform, clock, health, sink, stop_rx, interval))?;
        Ok(Poller {
            stop: stop_tx,
            handle,
        })
    }
}

fn poll_loop(
    platform: Arc<dyn Platform>,
    clock: Arc<dyn Clock>,
    health: Arc<SourceHealth>,
    sink: EventSink,
    stop: Receiver<()>,
    interval: Duration,
) {
    let mut known: Option<HashSet<ProcessId>> = None;
    let mut failures = 0u32;
    loop {
        match platform.snapshot() {
            Ok(entries) => {
                failures = 0;
                health.set_session_error(false);
                let now = clock.now_ms();
                health.heartbeat(now);
                let current: HashSet<ProcessId> = entries.iter().map(|e| e.pid).collect();
                if let Some(previous) = &known {
                    for entry in entries.iter().filter(|e| !previous.contains(&e.pid)) {
                        trace!(pid = %entry.pid, image = %entry.image, "process appeared");
                        health.record_event(now);
                        sink.process_started(entry.pid, entry.parent, &entry.image);
                    }
                }
                known = Some(current);
            }
            Err(err) => {
                failures += 1;
                debug!(error = %err, failures, "process snapshot failed");
                if failures >= MAX_POLL_FAILURES {
                    health.set_session_error(true);
                }
            }
        }

        match stop.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }
}

impl EventSource for SnapshotEventSource {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn start(&self, sink: EventSink) -> Result<(), EventSourceError> {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return Err(EventSourceError::AlreadyRunning);
        }
        *poller = Some(self.spawn(sink.clone())?);
        *lock(&self.sink) = Some(sink);
        self.health.set_running(true);
        debug!(poll_ms = self.poll_ms, "snapshot event source started");
        Ok(())
    }

    fn stop(&self) {
        let poller = lock(&self.poller).take();
        self.health.set_running(false);
        if let Some(poller) = poller {
            let _ = poller.stop.send(());
            if poller.handle.join().is_err() {
                warn!("snapshot poller panicked");
            }
        }
    }

    fn restart(&self) -> Result<(), EventSourceError> {
        let sink = lock(&self.sink).clone().ok_or(EventSourceError::NotStarted)?;
        self.stop();
        self.start(sink)
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy(self.clock.now_ms())
    }

    fn event_count(&self) -> u64 {
        self.health.event_count()
    }
}

impl Drop for SnapshotEventSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source driven by hand from tests or an embedding host.
#[derive(Default)]
pub struct ManualEventSource {
    sink: Mutex<Option<EventSink>>,
    running: AtomicBool,
    healthy: AtomicBool,
    fail_restart: AtomicBool,
    events: AtomicU64,
    restarts: AtomicU64,
}

impl std::fmt::Debug for ManualEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEventSource")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("events", &self.events.load(Ordering::Relaxed))
            .finish()
    }
}

impl ManualEventSource {
    pub fn new() -> Self {
        let source = Self::default();
        source.healthy.store(true, Ordering::SeqCst);
        source
    }

    fn sink(&self) -> Option<EventSink> {
        lock(&self.sink).clone()
    }

    pub fn emit_process(&self, pid: u32, parent: u32, image: &str) -> bool {
        let Some(sink) = self.sink() else {
            return false;
        };
        self.events.fetch_add(1, Ordering::Relaxed);
        sink.process_started(ProcessId(pid), ProcessId(parent), image)
    }

    pub fn emit_thread(&self, pid: u32) -> bool {
        let Some(sink) = self.sink() else {
            return false;
        };
        self.events.fetch_add(1, Ordering::Relaxed);
        sink.thread_started(ProcessId(pid))
    }

    /// Script the health answer.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make restarts leave the source unhealthy.
    pub fn fail_restarts(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl EventSource for ManualEventSource {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn start(&self, sink: EventSink) -> Result<(), EventSourceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EventSourceError::AlreadyRunning);
        }
        *lock(&self.sink) = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn restart(&self) -> Result<(), EventSourceError> {
        if self.sink().is_none() {
            return Err(EventSourceError::NotStarted);
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        if !self.fail_restart.load(Ordering::SeqCst) {
            self.healthy.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.healthy.load(Ordering::SeqCst)
    }

    fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::platform::mock::MockPlatform;
    use tg_common::Phase;

    fn sink_with(
        capacity: usize,
    ) -> (
        EventSink,
        Receiver<ProcessStart>,
        Receiver<EnforcementRequest>,
        Arc<EngineShared>,
    ) {
        let (start_tx, start_rx) = crossbeam_channel::bounded(capacity);
        let (req_tx, req_rx) = crossbeam_channel::bounded(capacity);
        let shared = Arc::new(EngineShared::new());
        (
            EventSink::new(start_tx, req_tx, Arc::clone(&shared)),
            start_rx,
            req_rx,
            shared,
        )
    }

    #[test]
    fn test_thread_events_filtered_by_phase() {
        let (sink, _starts, requests, shared) = sink_with(8);
        shared.index.set(ProcessId(10), Phase::Aggressive);
        shared.index.set(ProcessId(20), Phase::Stable);
        shared.index.set(ProcessId(30), Phase::Persistent);

        assert!(!sink.thread_started(ProcessId(10)));
        assert!(sink.thread_started(ProcessId(20)));
        assert!(sink.thread_started(ProcessId(30)));
        assert!(!sink.thread_started(ProcessId(99)));

        let pids: Vec<_> = requests.try_iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![ProcessId(20), ProcessId(30)]);
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let (sink, _starts, _requests, shared) = sink_with(1);
        assert!(sink.process_started(ProcessId(1), ProcessId(0), "a.exe"));
        assert!(!sink.process_started(ProcessId(2), ProcessId(0), "b.exe"));
        assert_eq!(
            shared.stats.dropped_requests.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_source_health_starvation() {
        let health = SourceHealth::default();
        assert!(!health.is_healthy(0));
        health.set_running(true);
        assert!(health.is_healthy(0));
        health.record_event(1_000);
        assert!(health.is_healthy(61_000));
        assert!(!health.is_healthy(61_001));
        health.heartbeat(61_001);
        assert!(health.is_healthy(61_001));
        health.set_session_error(true);
        assert!(!health.is_healthy(61_001));
        assert_eq!(health.event_count(), 1);
    }

    #[test]
    fn test_manual_source_restart() {
        let (sink, starts, _requests, _shared) = sink_with(8);
        let source = ManualEventSource::new();
        assert!(matches!(source.restart(), Err(EventSourceError::NotStarted)));
        source.start(sink).unwrap();
        assert!(source.emit_process(5, 1, "game.exe"));
        assert_eq!(starts.try_recv().unwrap().image, "game.exe");

        source.set_healthy(false);
        assert!(!source.is_healthy());
        source.restart().unwrap();
        assert!(source.is_healthy());
        assert_eq!(source.restarts(), 1);

        source.set_healthy(false);
        source.fail_restarts(true);
        source.restart().unwrap();
        assert!(!source.is_healthy());
    }

    #[test]
    fn test_snapshot_source_reports_new_processes() {
        let mock = MockPlatform::new().with_process(100, 1, "already.exe");
        let (sink, starts, _requests, _shared) = sink_with(64);
        let source = SnapshotEventSource::new(
            Arc::new(mock.clone()),
            Arc::new(SystemClock::new()),
            10,
        );
        source.start(sink).unwrap();
        // wait for the baseline snapshot before spawning
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while source.health.last_activity_ms.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "no baseline snapshot");
            thread::sleep(Duration::from_millis(5));
        }
        mock.spawn(200, 100, "new.exe");

        let event = starts
            .recv_timeout(Duration::from_secs(5))
            .expect("start event");
        assert_eq!(event.pid, ProcessId(200));
        assert_eq!(event.parent, ProcessId(100));
        assert!(source.is_healthy());
        assert!(source.event_count() >= 1);

        source.stop();
        assert!(!source.is_healthy());
        assert!(matches!(
            source.start(sink_with(1).0),
            Ok(())
        ));
        source.stop();
    }

    #[test]
    fn test_snapshot_source_rejects_double_start() {
        let mock = MockPlatform::new();
        let (sink, _starts, _requests, _shared) = sink_with(8);
        let source =
            SnapshotEventSource::new(Arc::new(mock), Arc::new(ManualClock::new(0)), 10);
        source.start(sink.clone()).unwrap();
        assert!(matches!(
            source.start(sink),
            Err(EventSourceError::AlreadyRunning)
        ));
        source.stop();
    }
}
