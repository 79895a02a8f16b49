//! Test utilities for tg-core.
//!
//! This module provides test infrastructure including:
//! - Common assertions
//! - A deterministic dispatcher [`Harness`] driven by a manual clock and a
//!   manual timer queue, with the mock platform and policy store behind it

use crate::clock::{Clock, ManualClock};
use crate::engine::{
    DispatchContext, Dispatcher, EngineConfig, EngineShared, EnforcementRequest, ProcessStart,
    ProcessView,
};
use crate::ledger::PolicyLedger;
use crate::platform::mock::{MockPlatform, MockPolicyStore};
use crate::platform::ProcessExit;
use crate::timers::TimerQueue;
use crossbeam_channel::{bounded, unbounded, Receiver};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tg_common::{normalize_image_name, Phase, ProcessId};

// ============================================================================
// Macros
// ============================================================================

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

/// Assert that a Result is Err.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(val) => panic!("Expected Err, got Ok: {:?}", val),
            Err(_) => {}
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => panic!("{}: got Ok({:?})", $msg, val),
            Err(_) => {}
        }
    };
}

// ============================================================================
// Dispatcher harness
// ============================================================================

/// A dispatcher wired to in-memory collaborators, run on the test thread.
///
/// Timer callbacks enqueue requests exactly as in production; [`advance`]
/// moves the clock deadline by deadline and dispatches whatever each step
/// enqueued, so phase timing can be asserted to the millisecond.
///
/// [`advance`]: Harness::advance
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub timers: TimerQueue,
    pub platform: MockPlatform,
    pub policies: MockPolicyStore,
    pub shared: Arc<EngineShared>,
    pub ledger: Arc<Mutex<PolicyLedger>>,
    pub dispatcher: Dispatcher,
    pub targets: HashSet<String>,
    requests: Receiver<EnforcementRequest>,
    exits: Receiver<ProcessExit>,
    dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(platform: MockPlatform) -> Self {
        Self::with_config(platform, EngineConfig::default())
    }

    pub fn with_config(platform: MockPlatform, config: EngineConfig) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let clock = Arc::new(ManualClock::new(1_000));
        let timers = TimerQueue::manual(clock.clone());
        let policies = MockPolicyStore::new();
        let shared = Arc::new(EngineShared::new());
        shared.set_running(true);
        let ledger = Arc::new(Mutex::new(PolicyLedger::open(
            dir.path(),
            Arc::new(policies.clone()),
        )));
        let (request_tx, requests) = bounded(config.request_queue_capacity.max(1));
        let (exit_tx, exits) = unbounded();

        let dispatcher = Dispatcher::new(DispatchContext {
            platform: Arc::new(platform.clone()),
            timers: timers.clone(),
            clock: clock.clone(),
            config,
            shared: Arc::clone(&shared),
            ledger: Arc::clone(&ledger),
            requests: request_tx,
            exits: exit_tx,
        });

        Self {
            clock,
            timers,
            platform,
            policies,
            shared,
            ledger,
            dispatcher,
            targets: HashSet::new(),
            requests,
            exits,
            dir,
        }
    }

    /// Add enabled target names.
    pub fn with_targets(mut self, names: &[&str]) -> Self {
        self.targets
            .extend(names.iter().map(|n| normalize_image_name(n)));
        self
    }

    pub fn base_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn ledger(&self) -> MutexGuard<'_, PolicyLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a root target directly.
    pub fn enforce_root(&mut self, pid: u32, image: &str) -> bool {
        let parent = ProcessId(1);
        self.dispatcher
            .enforce(ProcessId(pid), parent, image, None)
    }

    /// Deliver a process-start event.
    pub fn start(&mut self, pid: u32, parent: u32, image: &str) -> bool {
        let event = ProcessStart {
            pid: ProcessId(pid),
            parent: ProcessId(parent),
            image: image.to_string(),
        };
        let tracked = self.dispatcher.on_process_start(&event, &self.targets);
        self.pump();
        tracked
    }

    /// Deliver a thread-start event for a tracked pid.
    pub fn thread_event(&mut self, pid: u32) {
        self.dispatcher
            .dispatch(EnforcementRequest::thread_event(ProcessId(pid)));
        self.pump();
    }

    /// Run one safety-net sweep and dispatch what it queued.
    pub fn safety_net(&mut self) -> usize {
        let queued = self.dispatcher.safety_net();
        self.pump();
        queued
    }

    /// Dispatch everything waiting on the request and exit channels.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            while let Ok(exit) = self.exits.try_recv() {
                self.dispatcher.on_exit(exit);
                handled += 1;
                progressed = true;
            }
            if let Ok(req) = self.requests.try_recv() {
                self.dispatcher.dispatch(req);
                handled += 1;
                progressed = true;
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Move the clock forward by `ms`, firing timers at their exact
    /// deadlines and dispatching after each.
    pub fn advance(&mut self, ms: u64) {
        let target = self.clock.now_ms() + ms;
        self.advance_to(target);
    }

    pub fn advance_to(&mut self, target: u64) {
        self.pump();
        while let Some(due) = self.timers.next_deadline().filter(|due| *due <= target) {
            if due > self.clock.now_ms() {
                self.clock.set(due);
            }
            let fired = self.timers.fire_due();
            self.pump();
            if fired == 0 {
                break;
            }
        }
        if target > self.clock.now_ms() {
            self.clock.set(target);
        }
        self.pump();
    }

    pub fn view(&self, pid: u32) -> Option<ProcessView> {
        self.dispatcher.view(ProcessId(pid))
    }

    pub fn phase(&self, pid: u32) -> Option<Phase> {
        self.view(pid).map(|v| v.phase)
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.dispatcher.table().contains(ProcessId(pid))
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("now", &self.now())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
