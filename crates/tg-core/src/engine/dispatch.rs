//! Enforcement dispatcher and per-process phase machine.
//!
//! Runs only on the control thread. Every transition is driven by a request
//! popped from the queue, a process-start event, or an exit notification,
//! so phase fields are never touched concurrently.

use super::healing::{classify, Recovery};
use super::request::{EnforcementRequest, ProcessStart, RequestKind};
use super::shared::{bump, EngineShared};
use super::table::{ProcessTable, ProcessView, TrackedProcess};
use super::{EngineConfig, VERIFY_STEPS};
use crate::clock::Clock;
use crate::grouping::GroupingTracker;
use crate::ledger::{ApplyOutcome, PolicyLedger};
use crate::logging::ErrorLogSuppressor;
use crate::platform::{Platform, ProcessExit};
use crate::timers::{TimerCallback, TimerQueue};
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tg_common::{is_critical_process, normalize_image_name, OsError, Phase, ProcessId};
use tracing::{debug, info, trace, warn};

/// Collaborators handed to the dispatcher when the control thread starts.
pub struct DispatchContext {
    pub platform: Arc<dyn Platform>,
    pub timers: TimerQueue,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub shared: Arc<EngineShared>,
    pub ledger: Arc<Mutex<PolicyLedger>>,
    /// Where timer callbacks enqueue their requests.
    pub requests: Sender<EnforcementRequest>,
    /// Where exit watches deliver notifications.
    pub exits: Sender<ProcessExit>,
}

/// Everything except the table, so a tracked record can be borrowed
/// mutably from the table while these are in use.
pub(crate) struct Enforcer {
    pub(crate) platform: Arc<dyn Platform>,
    timers: TimerQueue,
    clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    pub(crate) shared: Arc<EngineShared>,
    ledger: Arc<Mutex<PolicyLedger>>,
    pub(crate) groups: GroupingTracker,
    requests: Sender<EnforcementRequest>,
    exits: Sender<ProcessExit>,
    suppressor: ErrorLogSuppressor,
    /// Last generation handed to a tracked record.
    generation: u64,
}

/// Owner of the tracked-process table.
pub struct Dispatcher {
    pub(crate) table: ProcessTable,
    pub(crate) core: Enforcer,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracked", &self.table.len())
            .field("groups", &self.core.groups.len())
            .finish()
    }
}

impl Enforcer {
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn request_callback(&self, req: EnforcementRequest) -> TimerCallback {
        let tx = self.requests.clone();
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            if tx.try_send(req).is_err() {
                bump(&shared.stats.dropped_requests);
            }
        })
    }

    /// Non-blocking enqueue from the control thread itself.
    pub(crate) fn send(&self, req: EnforcementRequest) -> bool {
        match self.requests.try_send(req) {
            Ok(()) => true,
            Err(_) => {
                bump(&self.shared.stats.dropped_requests);
                false
            }
        }
    }

    fn set_phase(&self, proc: &mut TrackedProcess, phase: Phase, now: u64) {
        proc.phase = phase;
        proc.phase_started_ms = now;
        self.shared.index.set(proc.pid, phase);
    }

    /// One override pulse. Failures go through self-healing.
    fn pulse(&mut self, proc: &mut TrackedProcess) -> bool {
        let Some(control) = proc.control.as_ref() else {
            return false;
        };
        match control.force_full_power() {
            Ok(()) => {
                let threads = self.platform.disable_thread_throttling(proc.pid);
                if proc.healing.consecutive_failures > 0 {
                    debug!(pid = %proc.pid, image = %proc.image, "override recovered");
                }
                proc.healing.reset();
                trace!(pid = %proc.pid, threads, "override applied");
                true
            }
            Err(err) => {
                self.heal(proc, err);
                false
            }
        }
    }

    fn heal(&mut self, proc: &mut TrackedProcess, err: OsError) {
        self.shared.stats.record_os_error(err);
        let attempt = proc.healing.record(err);
        let alive = proc.control.as_ref().is_some_and(|c| c.is_alive());
        let now = self.now();
        let loud = self.suppressor.should_log(proc.pid.0, err.code, now);

        match classify(err, attempt, alive, &self.config) {
            Recovery::RetryAfter(delay_ms) => {
                if loud {
                    debug!(
                        pid = %proc.pid,
                        image = %proc.image,
                        code = err.code,
                        attempt,
                        delay_ms,
                        "override failed, retrying"
                    );
                }
                bump(&self.shared.stats.retries);
                let req = EnforcementRequest::new(proc.pid, RequestKind::RetryEnforce);
                proc.retry = self
                    .timers
                    .schedule_once(delay_ms, self.request_callback(req));
            }
            Recovery::GiveUp => {
                proc.retry = None;
                if !proc.healing.gave_up {
                    proc.healing.gave_up = true;
                    warn!(
                        pid = %proc.pid,
                        image = %proc.image,
                        code = err.code,
                        attempts = attempt,
                        "override keeps failing, waiting for next trigger"
                    );
                }
            }
            Recovery::ReleaseHandle | Recovery::ProcessGone => {
                proc.retry = None;
                proc.control = None;
                debug!(pid = %proc.pid, code = err.code, "handle released");
            }
        }
    }

    /// Query throttle state. Query failures count as "not throttled".
    fn check_throttled(&mut self, proc: &mut TrackedProcess) -> bool {
        let Some(control) = proc.control.as_ref() else {
            return false;
        };
        match control.is_throttled() {
            Ok(throttled) => throttled,
            Err(err) => {
                self.shared.stats.record_os_error(err);
                if err.indicates_process_gone() {
                    proc.control = None;
                    debug!(pid = %proc.pid, code = err.code, "handle released after failed query");
                } else if self.suppressor.should_log(proc.pid.0, err.code, self.now()) {
                    debug!(pid = %proc.pid, code = err.code, "power state query failed");
                }
                false
            }
        }
    }

    /// Arm deferred verification `step` (1-based) with a fresh ticket.
    fn arm_verify(&self, proc: &mut TrackedProcess, step: u8) {
        let step = step.clamp(1, VERIFY_STEPS);
        proc.deferred_generation = proc.deferred_generation.wrapping_add(1);
        proc.deferred_step = step;
        let delay = self.config.verify_delays_ms[usize::from(step - 1)];
        let req = EnforcementRequest::new(
            proc.pid,
            RequestKind::DeferredVerify {
                step,
                generation: proc.deferred_generation,
            },
        );
        proc.deferred = self.timers.schedule_once(delay, self.request_callback(req));
    }

    fn enter_aggressive(&self, proc: &mut TrackedProcess, now: u64) {
        proc.persistent = None;
        self.set_phase(proc, Phase::Aggressive, now);
        self.arm_verify(proc, 1);
    }

    fn enter_stable(&self, proc: &mut TrackedProcess, now: u64) {
        proc.deferred = None;
        proc.persistent = None;
        self.set_phase(proc, Phase::Stable, now);
        info!(
            pid = %proc.pid,
            image = %proc.image,
            violations = proc.violations,
            "process stable"
        );
    }

    fn enter_persistent(&self, proc: &mut TrackedProcess, now: u64) {
        proc.deferred = None;
        self.set_phase(proc, Phase::Persistent, now);
        let req = EnforcementRequest::new(proc.pid, RequestKind::PersistentTick);
        proc.persistent = self.timers.schedule_repeating(
            self.config.persistent_interval_ms,
            self.request_callback(req),
        );
        warn!(
            pid = %proc.pid,
            image = %proc.image,
            violations = proc.violations,
            "process keeps getting re-throttled, switching to persistent enforcement"
        );
    }

    fn record_violation(&self, proc: &mut TrackedProcess, now: u64) {
        proc.violations = proc.violations.saturating_add(1);
        proc.last_violation_ms = Some(now);
        bump(&self.shared.stats.total_violations);
    }

    /// Throttling found on a process that had settled.
    fn escalate(&mut self, proc: &mut TrackedProcess, now: u64, trigger: &'static str) {
        self.record_violation(proc, now);
        self.pulse(proc);
        debug!(
            pid = %proc.pid,
            image = %proc.image,
            violations = proc.violations,
            trigger,
            "throttling re-applied by the OS"
        );
        if proc.violations >= self.config.violation_threshold {
            self.enter_persistent(proc, now);
        } else {
            self.enter_aggressive(proc, now);
        }
    }

    fn on_thread_event(&mut self, proc: &mut TrackedProcess, now: u64) {
        match proc.phase {
            Phase::Aggressive => {}
            Phase::Stable => {
                if !self.ensure_handle(proc) {
                    return;
                }
                proc.last_check_ms = now;
                if self.check_throttled(proc) {
                    self.escalate(proc, now, "thread_event");
                }
            }
            Phase::Persistent => {
                let due = proc.last_thread_enforce_ms.map_or(true, |last| {
                    now.saturating_sub(last) >= self.config.thread_event_rate_limit_ms
                });
                if !due || !self.ensure_handle(proc) {
                    return;
                }
                proc.last_thread_enforce_ms = Some(now);
                proc.last_check_ms = now;
                if self.check_throttled(proc) {
                    self.pulse(proc);
                    proc.last_violation_ms = Some(now);
                }
            }
        }
    }

    fn on_deferred_verify(&mut self, proc: &mut TrackedProcess, step: u8, generation: u64, now: u64) {
        if proc.phase != Phase::Aggressive || generation != proc.deferred_generation {
            trace!(pid = %proc.pid, step, generation, "stale verification ignored");
            return;
        }
        proc.deferred = None;
        proc.last_check_ms = now;

        if self.check_throttled(proc) {
            self.record_violation(proc, now);
            self.pulse(proc);
            if proc.violations >= self.config.violation_threshold {
                self.enter_persistent(proc, now);
            } else {
                debug!(
                    pid = %proc.pid,
                    violations = proc.violations,
                    step,
                    "still throttled, restarting verification"
                );
                self.arm_verify(proc, 1);
            }
        } else if step >= VERIFY_STEPS {
            self.enter_stable(proc, now);
        } else {
            self.arm_verify(proc, step + 1);
        }
    }

    fn on_persistent_tick(&mut self, proc: &mut TrackedProcess, now: u64) {
        if proc.phase != Phase::Persistent {
            return;
        }
        if !self.ensure_handle(proc) {
            bump(&self.shared.stats.persistent_skipped);
            return;
        }

        let throttled = self.check_throttled(proc);
        if throttled {
            proc.last_violation_ms = Some(now);
        }
        if self.pulse(proc) {
            bump(&self.shared.stats.persistent_applied);
        } else {
            bump(&self.shared.stats.persistent_skipped);
        }
        proc.last_check_ms = now;

        if !throttled {
            let quiet_since = proc.last_violation_ms.unwrap_or(proc.phase_started_ms);
            if now.saturating_sub(quiet_since) >= self.config.persistent_clean_ms {
                self.enter_stable(proc, now);
            }
        }
    }

    fn on_safety_net(&mut self, proc: &mut TrackedProcess, now: u64) {
        if proc.phase != Phase::Stable {
            return;
        }
        match proc.control.as_ref() {
            Some(control) if !control.is_alive() => {
                // exit notification was lost; route through the exit path
                let _ = self.exits.send(proc.exit_notice());
                return;
            }
            Some(_) => {}
            None => {
                if !self.reopen(proc) {
                    return;
                }
            }
        }
        proc.last_check_ms = now;
        if self.check_throttled(proc) {
            self.escalate(proc, now, "safety_net");
        }
    }

    /// The current handle, or a reopened one after an earlier release.
    fn ensure_handle(&mut self, proc: &mut TrackedProcess) -> bool {
        proc.control.is_some() || self.reopen(proc)
    }

    /// Reopen a released handle if the same image still owns the pid.
    ///
    /// A pid now owned by a different image means the tracked process is
    /// gone; that is routed through the exit path.
    fn reopen(&mut self, proc: &mut TrackedProcess) -> bool {
        match self.platform.image_name(proc.pid) {
            Some(name) if normalize_image_name(&name) == proc.image => {}
            Some(name) => {
                debug!(pid = %proc.pid, image = %proc.image, now = %name, "pid reused while released");
                let _ = self.exits.send(proc.exit_notice());
                return false;
            }
            None => return false,
        }
        match self.platform.open_process(proc.pid) {
            Ok(control) => {
                proc.control = Some(control);
                proc.healing.reset();
                bump(&self.shared.stats.handle_reopens);
                debug!(pid = %proc.pid, image = %proc.image, "handle reopened");
                true
            }
            Err(err) => {
                self.shared.stats.record_os_error(err);
                false
            }
        }
    }

    fn on_retry(&mut self, proc: &mut TrackedProcess) {
        proc.retry = None;
        if proc.control.is_some() {
            self.pulse(proc);
        }
    }

    /// Open, register and pulse a new process. `None` if it cannot be opened.
    fn track(
        &mut self,
        pid: ProcessId,
        parent: ProcessId,
        image: String,
        root: Option<ProcessId>,
    ) -> Option<TrackedProcess> {
        let now = self.now();
        let control = match self.platform.open_process(pid) {
            Ok(control) => control,
            Err(err) => {
                self.shared.stats.record_os_error(err);
                if err.indicates_process_gone() {
                    debug!(pid = %pid, image = %image, "process gone before it could be tracked");
                } else if self.suppressor.should_log(pid.0, err.code, now) {
                    warn!(pid = %pid, image = %image, error = %err, "cannot open process");
                }
                return None;
            }
        };

        self.generation = self.generation.wrapping_add(1);
        let mut proc =
            TrackedProcess::new(pid, parent, image, root, control, self.generation, now);
        match self.platform.watch_exit(proc.exit_notice(), self.exits.clone()) {
            Ok(watch) => proc.exit_watch = Some(watch),
            Err(err) => {
                if !proc.control.as_ref().is_some_and(|c| c.is_alive()) {
                    debug!(pid = %pid, "process exited during registration");
                    return None;
                }
                debug!(pid = %pid, error = %err, "exit watch registration failed");
            }
        }

        if !proc.is_child {
            self.attach_root(&mut proc);
        }

        self.shared.index.set(pid, Phase::Aggressive);
        self.pulse(&mut proc);
        self.arm_verify(&mut proc, 1);

        info!(
            pid = %pid,
            image = %proc.image,
            child = proc.is_child,
            root = %proc.root,
            in_group = proc.in_group,
            "tracking process"
        );
        Some(proc)
    }

    /// Grouping and persistent policies for a root target.
    fn attach_root(&mut self, proc: &mut TrackedProcess) {
        let Some(control) = proc.control.as_deref() else {
            return;
        };
        let attachment = self.groups.attach(proc.pid, control);
        proc.in_group = attachment.in_group();
        proc.group_assignment_failed = attachment.assignment_failed();

        let Some(path) = control.image_path() else {
            debug!(pid = %proc.pid, "image path unavailable, persistent policies skipped");
            return;
        };
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        match ledger.apply(&proc.image, &path) {
            Ok(ApplyOutcome::Applied) => {
                info!(image = %proc.image, path = %path, "persistent policies applied")
            }
            Ok(ApplyOutcome::AlreadyApplied) => {}
            Err(err) => warn!(image = %proc.image, error = %err, "persistent policy apply failed"),
        }
    }
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext) -> Self {
        let groups = GroupingTracker::new(Arc::clone(&ctx.platform), ctx.config.max_group_pids);
        let suppressor = ErrorLogSuppressor::new(ctx.config.error_log_window_ms);
        Self {
            table: ProcessTable::new(),
            core: Enforcer {
                platform: ctx.platform,
                timers: ctx.timers,
                clock: ctx.clock,
                config: ctx.config,
                shared: ctx.shared,
                ledger: ctx.ledger,
                groups,
                requests: ctx.requests,
                exits: ctx.exits,
                suppressor,
                generation: 0,
            },
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn groups(&self) -> &GroupingTracker {
        &self.core.groups
    }

    pub fn view(&self, pid: ProcessId) -> Option<ProcessView> {
        self.table.get(pid).map(TrackedProcess::view)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Apply one request. Requests for untracked pids are no-ops.
    pub fn dispatch(&mut self, req: EnforcementRequest) {
        let Some(proc) = self.table.get_mut(req.pid) else {
            trace!(pid = %req.pid, kind = ?req.kind, "request for untracked pid ignored");
            return;
        };
        let core = &mut self.core;
        let now = core.now();
        match req.kind {
            RequestKind::ThreadEvent => core.on_thread_event(proc, now),
            RequestKind::DeferredVerify { step, generation } => {
                core.on_deferred_verify(proc, step, generation, now)
            }
            RequestKind::PersistentTick => core.on_persistent_tick(proc, now),
            RequestKind::SafetyNetCheck => core.on_safety_net(proc, now),
            RequestKind::RetryEnforce => core.on_retry(proc),
        }
    }

    /// Start tracking `pid`. `root` is `Some` for descendants.
    ///
    /// Returns true when the pid is tracked afterwards.
    pub fn enforce(
        &mut self,
        pid: ProcessId,
        parent: ProcessId,
        image: &str,
        root: Option<ProcessId>,
    ) -> bool {
        if self.table.contains(pid) {
            return true;
        }
        let image = normalize_image_name(image);
        if pid.is_system() || is_critical_process(&image) {
            debug!(pid = %pid, image = %image, "critical process skipped");
            return false;
        }
        match self.core.track(pid, parent, image, root) {
            Some(proc) => {
                self.table.insert(proc);
                true
            }
            None => false,
        }
    }

    /// Handle a process-creation event.
    pub fn on_process_start(&mut self, event: &ProcessStart, targets: &HashSet<String>) -> bool {
        let image = normalize_image_name(&event.image);
        if is_critical_process(&image) {
            return false;
        }
        if let Some(existing) = self.table.get(event.pid) {
            if existing.image == image && existing.is_alive() {
                return true;
            }
            // pid reused before its exit was handled
            self.remove(event.pid);
        }
        if let Some(parent) = self.table.get(event.parent) {
            let root = parent.root;
            return self.enforce(event.pid, event.parent, &image, Some(root));
        }
        if targets.contains(&image) {
            return self.enforce(event.pid, event.parent, &image, None);
        }
        false
    }

    /// Handle an exit notification. Notifications for an earlier record of
    /// a recycled pid are ignored.
    pub fn on_exit(&mut self, exit: ProcessExit) -> bool {
        match self.table.get(exit.pid) {
            Some(proc) if proc.track_generation == exit.generation => self.remove(exit.pid),
            Some(_) => {
                debug!(pid = %exit.pid, generation = exit.generation, "stale exit notification ignored");
                false
            }
            None => false,
        }
    }

    /// Drop `pid` and release everything it owns. Safe to call twice.
    pub fn remove(&mut self, pid: ProcessId) -> bool {
        let Some(proc) = self.table.remove(pid) else {
            return false;
        };
        self.core.shared.index.remove(pid);
        self.core.suppressor.forget(pid.0);
        if !proc.is_child {
            self.core.groups.release(pid);
        }
        info!(
            pid = %pid,
            image = %proc.image,
            phase = %proc.phase,
            violations = proc.violations,
            "process untracked"
        );
        drop(proc);
        true
    }

    /// Queue a safety-net check for every stable process, and re-arm
    /// aggressive processes whose verification request was lost.
    pub fn safety_net(&mut self) -> usize {
        let now = self.core.now();
        let mut queued = 0;
        let mut stalled = Vec::new();
        for proc in self.table.iter() {
            match proc.phase {
                Phase::Stable => {
                    if self.core.send(EnforcementRequest::safety_net(proc.pid)) {
                        queued += 1;
                    }
                }
                Phase::Aggressive => {
                    let armed = proc.deferred.as_ref().is_some_and(|g| g.is_scheduled());
                    if !armed
                        && now.saturating_sub(proc.last_check_ms) >= self.core.config.safety_net_ms
                    {
                        stalled.push(proc.pid);
                    }
                }
                Phase::Persistent => {}
            }
        }
        for pid in stalled {
            if let Some(proc) = self.table.get_mut(pid) {
                debug!(pid = %pid, "verification stalled, re-arming");
                proc.last_check_ms = now;
                self.core.arm_verify(proc, 1);
            }
        }
        queued
    }

    /// Enforce descendants that appeared in owned groups without a start
    /// event. Returns how many were added.
    pub fn refresh_groups(&mut self) -> usize {
        if self.core.groups.is_empty() {
            return 0;
        }
        let table = &self.table;
        let found = self.core.groups.collect_untracked(|pid| table.contains(pid));
        let mut added = 0;
        for discovered in found {
            let Some(image) = self.core.platform.image_name(discovered.pid) else {
                continue;
            };
            if self.enforce(discovered.pid, discovered.root, &image, Some(discovered.root)) {
                debug!(pid = %discovered.pid, root = %discovered.root, "group member enforced");
                added += 1;
            }
        }
        added
    }

    /// Final teardown on the control thread.
    ///
    /// Timers are stopped first so no callback can run against a record
    /// being dropped; then records are dropped, then groups closed.
    pub fn shutdown(&mut self) -> usize {
        self.core.timers.shutdown();
        let released = self.table.clear();
        self.core.shared.index.clear();
        let groups = self.core.groups.clear();
        debug!(released, groups, "dispatcher shut down");
        released
    }
}
