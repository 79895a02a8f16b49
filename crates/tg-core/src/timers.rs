//! Shared timer queue.
//!
//! One worker thread serves every deferred-verification and persistent
//! enforcement timer in the engine. Callbacks run on the worker with no
//! lock held and are expected to do nothing but enqueue a request.
//!
//! Ownership: scheduling returns a [`TimerGuard`]. Dropping the guard
//! cancels the timer and blocks until a callback already running for it has
//! returned, so a process record can be freed immediately afterwards
//! without racing its own timer.
//!
//! A queue built with [`TimerQueue::manual`] has no worker; due timers fire
//! only when [`TimerQueue::fire_due`] is called, which makes phase tests
//! fully deterministic.

use crate::clock::Clock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error};

/// Callback invoked when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Identity of a scheduled timer. Never reused within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct Entry {
    due_ms: u64,
    period_ms: Option<u64>,
    callback: TimerCallback,
}

#[derive(Default)]
struct State {
    next_id: u64,
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    entries: HashMap<u64, Entry>,
    /// Timer id -> thread currently running its callback.
    in_flight: HashMap<u64, ThreadId>,
    shutdown: bool,
}

impl State {
    /// Pop the earliest due entry, rescheduling it if periodic.
    fn take_due(&mut self, now: u64) -> Option<(u64, TimerCallback)> {
        while let Some(Reverse((due, id))) = self.heap.peek().copied() {
            let live = self.entries.get(&id).map(|e| e.due_ms) == Some(due);
            if !live {
                self.heap.pop();
                continue;
            }
            if due > now {
                return None;
            }
            self.heap.pop();

            let (callback, reschedule) = match self.entries.get_mut(&id) {
                Some(entry) => match entry.period_ms {
                    Some(period) => {
                        entry.due_ms = now + period.max(1);
                        (entry.callback.clone(), Some(entry.due_ms))
                    }
                    None => (entry.callback.clone(), None),
                },
                None => continue,
            };
            match reschedule {
                Some(next) => self.heap.push(Reverse((next, id))),
                None => {
                    self.entries.remove(&id);
                }
            }
            self.in_flight.insert(id, thread::current().id());
            return Some((id, callback));
        }
        None
    }

    fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse((due, id))) = self.heap.peek().copied() {
            if self.entries.get(&id).map(|e| e.due_ms) == Some(due) {
                return Some(due);
            }
            self.heap.pop();
        }
        None
    }
}

struct Inner {
    state: Mutex<State>,
    /// Signalled when the earliest deadline may have moved or on shutdown.
    changed: Condvar,
    /// Signalled whenever an in-flight callback completes.
    idle: Condvar,
    clock: Arc<dyn Clock>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the shared timer facility. Cheap to clone.
#[derive(Clone)]
pub struct TimerQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("TimerQueue")
            .field("pending", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl TimerQueue {
    fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
                idle: Condvar::new(),
                clock,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Start a queue with a dedicated worker thread.
    pub fn start(clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let queue = Self::with_clock(clock);
        let inner = Arc::clone(&queue.inner);
        let handle = thread::Builder::new()
            .name("tg-timers".to_string())
            .spawn(move || run_worker(inner))?;
        *lock(&queue.inner.worker) = Some(handle);
        Ok(queue)
    }

    /// A queue without a worker; see [`TimerQueue::fire_due`].
    pub fn manual(clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(clock)
    }

    /// Fire `callback` once after `delay_ms`.
    ///
    /// Returns `None` once the queue has been shut down.
    pub fn schedule_once(&self, delay_ms: u64, callback: TimerCallback) -> Option<TimerGuard> {
        self.schedule(delay_ms, None, callback)
    }

    /// Fire `callback` every `period_ms`, first after one period.
    pub fn schedule_repeating(
        &self,
        period_ms: u64,
        callback: TimerCallback,
    ) -> Option<TimerGuard> {
        self.schedule(period_ms, Some(period_ms), callback)
    }

    fn schedule(
        &self,
        delay_ms: u64,
        period_ms: Option<u64>,
        callback: TimerCallback,
    ) -> Option<TimerGuard> {
        let due_ms = self.inner.clock.now_ms() + delay_ms;
        let mut state = lock(&self.inner.state);
        if state.shutdown {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.entries.insert(
            id,
            Entry {
                due_ms,
                period_ms,
                callback,
            },
        );
        state.heap.push(Reverse((due_ms, id)));
        drop(state);
        self.inner.changed.notify_all();

        Some(TimerGuard {
            queue: self.clone(),
            id: TimerId(id),
        })
    }

    /// Cancel a timer and wait for a running callback to finish.
    ///
    /// Returns whether the timer was still scheduled. Never blocks when
    /// called from inside the timer's own callback.
    pub fn cancel(&self, id: TimerId) -> bool {
        let me = thread::current().id();
        let mut state = lock(&self.inner.state);
        let removed = state.entries.remove(&id.0).is_some();
        while state
            .in_flight
            .get(&id.0)
            .is_some_and(|runner| *runner != me)
        {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        removed
    }

    /// Whether `id` is still scheduled.
    pub fn is_scheduled(&self, id: TimerId) -> bool {
        lock(&self.inner.state).entries.contains_key(&id.0)
    }

    /// Number of scheduled timers.
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    /// Earliest deadline among scheduled timers.
    pub fn next_deadline(&self) -> Option<u64> {
        lock(&self.inner.state).next_deadline()
    }

    /// Run every callback due at the clock's current time on the calling
    /// thread. Returns how many fired.
    pub fn fire_due(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.inner.clock.now_ms();
            let due = {
                let mut state = lock(&self.inner.state);
                if state.shutdown {
                    return fired;
                }
                state.take_due(now)
            };
            let Some((id, callback)) = due else {
                return fired;
            };
            invoke(id, &callback);
            self.finish(id);
            fired += 1;
        }
    }

    fn finish(&self, id: u64) {
        lock(&self.inner.state).in_flight.remove(&id);
        self.inner.idle.notify_all();
    }

    /// Stop the worker, wait for in-flight callbacks, drop all timers.
    ///
    /// Idempotent. Guards dropped afterwards are no-ops.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.inner.changed.notify_all();

        let worker = lock(&self.inner.worker).take();
        if let Some(handle) = worker {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("timer worker panicked during shutdown");
            }
        }

        let me = thread::current().id();
        let mut state = lock(&self.inner.state);
        while state.in_flight.values().any(|runner| *runner != me) {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let dropped = state.entries.len();
        state.entries.clear();
        state.heap.clear();
        debug!(dropped, "timer queue shut down");
    }
}

fn invoke(id: u64, callback: &TimerCallback) {
    if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
        error!(timer = id, "timer callback panicked");
    }
}

fn run_worker(inner: Arc<Inner>) {
    let queue = TimerQueue {
        inner: Arc::clone(&inner),
    };
    let mut state = lock(&inner.state);
    loop {
        if state.shutdown {
            break;
        }
        let now = inner.clock.now_ms();
        if let Some((id, callback)) = state.take_due(now) {
            drop(state);
            invoke(id, &callback);
            queue.finish(id);
            state = lock(&inner.state);
            continue;
        }
        state = match state.next_deadline() {
            Some(due) => {
                let wait = Duration::from_millis(due.saturating_sub(now).max(1));
                inner
                    .changed
                    .wait_timeout(state, wait)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0)
            }
            None => inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

/// Owning reference to a scheduled timer; cancels on drop.
pub struct TimerGuard {
    queue: TimerQueue,
    id: TimerId,
}

impl TimerGuard {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Whether the timer is still scheduled (one-shots that fired are not).
    pub fn is_scheduled(&self) -> bool {
        self.queue.is_scheduled(self.id)
    }
}

impl std::fmt::Debug for TimerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TimerGuard").field(&self.id).finish()
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.queue.cancel(self.id);
    }
}
