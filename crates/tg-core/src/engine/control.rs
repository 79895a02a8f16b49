//! The engine's single control thread.
//!
//! Blocks on a fixed set of channels (stop, config change, safety-net tick,
//! enforcement requests, process starts, exits) and does bounded periodic
//! maintenance after every wakeup. All table mutation happens here.

use super::dispatch::Dispatcher;
use super::request::{EnforcementRequest, ProcessStart};
use super::shared::{bump, read, EngineShared};
use super::EngineConfig;
use crate::clock::Clock;
use crate::event_source::EventSource;
use crate::logging;
use crate::platform::ProcessExit;
use crossbeam_channel::{never, select, tick, Receiver};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tg_common::OperationMode;
use tg_config::ConfigStore;
use tracing::{debug, info, warn};

/// Receiving ends of every channel the loop waits on.
pub struct ControlChannels {
    pub stop: Receiver<()>,
    pub config: Receiver<()>,
    pub requests: Receiver<EnforcementRequest>,
    pub starts: Receiver<ProcessStart>,
    pub exits: Receiver<ProcessExit>,
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Requests,
    Exits,
    Starts,
    Config,
}

/// Why the loop woke up.
enum Wake {
    Stop,
    Request(EnforcementRequest),
    Exit(ProcessExit),
    Start(ProcessStart),
    Config,
    SafetyNet,
    Idle,
    Closed(Channel),
}

/// Control-thread state.
pub struct ControlLoop {
    dispatcher: Dispatcher,
    store: ConfigStore,
    targets: HashSet<String>,
    source: Arc<dyn EventSource>,
    channels: ControlChannels,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    shared: Arc<EngineShared>,
    config_pending_since: Option<u64>,
    next_health_ms: u64,
    next_group_ms: u64,
    next_stats_ms: u64,
    next_rescan_ms: u64,
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("dispatcher", &self.dispatcher)
            .field("targets", &self.targets.len())
            .field("config_pending", &self.config_pending_since.is_some())
            .finish()
    }
}

impl ControlLoop {
    pub fn new(
        dispatcher: Dispatcher,
        store: ConfigStore,
        source: Arc<dyn EventSource>,
        channels: ControlChannels,
        clock: Arc<dyn Clock>,
        shared: Arc<EngineShared>,
    ) -> Self {
        let config = dispatcher.core.config.clone();
        let now = clock.now_ms();
        let targets = store.enabled_target_names();
        Self {
            dispatcher,
            store,
            targets,
            source,
            channels,
            clock,
            shared,
            config_pending_since: None,
            next_health_ms: now + config.health_check_ms,
            next_group_ms: now + config.group_refresh_ms,
            next_stats_ms: now + config.stats_interval_ms,
            next_rescan_ms: now + config.degraded_rescan_ms,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn targets(&self) -> &HashSet<String> {
        &self.targets
    }

    /// Track everything that is already running.
    pub fn start_up(&mut self) {
        info!(targets = self.targets.len(), "engine control loop starting");
        match self.dispatcher.initial_scan(&self.targets) {
            Ok(added) => info!(tracked = added, "initial scan complete"),
            Err(err) => warn!(error = %err, "initial scan failed"),
        }
    }

    /// Block until the stop signal, then tear down.
    pub fn run(&mut self) {
        let stop = self.channels.stop.clone();
        let mut config = self.channels.config.clone();
        let mut requests = self.channels.requests.clone();
        let mut starts = self.channels.starts.clone();
        let mut exits = self.channels.exits.clone();
        let safety = tick(Duration::from_millis(self.config.safety_net_ms.max(1)));

        loop {
            let timeout = Duration::from_millis(self.until_next_deadline());
            let wake = select! {
                recv(stop) -> _ => Wake::Stop,
                recv(requests) -> msg => msg.map_or(Wake::Closed(Channel::Requests), Wake::Request),
                recv(exits) -> msg => msg.map_or(Wake::Closed(Channel::Exits), Wake::Exit),
                recv(starts) -> msg => msg.map_or(Wake::Closed(Channel::Starts), Wake::Start),
                recv(config) -> msg => msg.map_or(Wake::Closed(Channel::Config), |()| Wake::Config),
                recv(safety) -> _ => Wake::SafetyNet,
                default(timeout) => Wake::Idle,
            };

            match wake {
                Wake::Stop => break,
                Wake::Request(req) => self.on_request(req),
                Wake::Exit(exit) => self.on_exit(exit),
                Wake::Start(event) => self.on_process_start(event),
                Wake::Config => self.on_config_signal(),
                Wake::SafetyNet => self.on_safety_net(),
                Wake::Idle => {}
                Wake::Closed(channel) => {
                    debug!(?channel, "channel closed");
                    match channel {
                        Channel::Requests => requests = never(),
                        Channel::Exits => exits = never(),
                        Channel::Starts => starts = never(),
                        Channel::Config => config = never(),
                    }
                }
            }
            self.maintenance();
        }
        self.shutdown();
    }

    fn until_next_deadline(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut next = self
            .next_health_ms
            .min(self.next_group_ms)
            .min(self.next_stats_ms);
        if self.shared.mode() == OperationMode::DegradedEventSource {
            next = next.min(self.next_rescan_ms);
        }
        if let Some(since) = self.config_pending_since {
            next = next.min(since + self.config.config_debounce_ms);
        }
        next.saturating_sub(now).max(1)
    }

    /// Dispatch `first` and everything queued behind it.
    pub fn on_request(&mut self, first: EnforcementRequest) {
        bump(&self.shared.stats.wakeup_enforcement_request);
        self.dispatcher.dispatch(first);
        for req in self.channels.requests.try_iter() {
            self.dispatcher.dispatch(req);
        }
    }

    pub fn on_process_start(&mut self, first: ProcessStart) {
        self.dispatcher.on_process_start(&first, &self.targets);
        for event in self.channels.starts.try_iter() {
            self.dispatcher.on_process_start(&event, &self.targets);
        }
    }

    pub fn on_exit(&mut self, first: ProcessExit) {
        bump(&self.shared.stats.wakeup_process_exit);
        self.dispatcher.on_exit(first);
        for exit in self.channels.exits.try_iter() {
            self.dispatcher.on_exit(exit);
        }
    }

    /// Start (or extend) the debounce window.
    pub fn on_config_signal(&mut self) {
        bump(&self.shared.stats.wakeup_config_change);
        bump(&self.shared.stats.config_changes_detected);
        self.config_pending_since = Some(self.clock.now_ms());
    }

    pub fn on_safety_net(&mut self) {
        bump(&self.shared.stats.wakeup_safety_net);
        let queued = self.dispatcher.safety_net();
        debug!(queued, "safety net sweep");
    }

    /// Apply a pending config change once the debounce window has passed.
    pub fn poll_config(&mut self) -> bool {
        let Some(since) = self.config_pending_since else {
            return false;
        };
        if self.clock.now_ms().saturating_sub(since) < self.config.config_debounce_ms {
            return false;
        }
        self.config_pending_since = None;
        self.apply_config_change()
    }

    fn apply_config_change(&mut self) -> bool {
        if !self.store.has_changed_on_disk() {
            debug!("config notification without a file change");
            return false;
        }
        match self.store.reload() {
            Ok(changed) => {
                bump(&self.shared.stats.config_reloads);
                logging::apply_file_level(self.store.log_level(), self.store.log_enabled());
                if changed {
                    self.targets = self.store.enabled_target_names();
                    info!(targets = self.targets.len(), "target list changed");
                    self.dispatcher.reconcile(&self.targets);
                } else {
                    debug!("config reloaded, targets unchanged");
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "config reload failed, keeping previous targets");
                false
            }
        }
    }

    /// Periodic work due at the current time.
    pub fn maintenance(&mut self) {
        let now = self.clock.now_ms();

        if now >= self.next_health_ms {
            self.next_health_ms = now + self.config.health_check_ms;
            self.check_event_source(now);
        }
        if now >= self.next_group_ms {
            self.next_group_ms = now + self.config.group_refresh_ms;
            let added = self.dispatcher.refresh_groups();
            if added > 0 {
                debug!(added, "group refresh enforced new members");
            }
        }
        if self.shared.mode() == OperationMode::DegradedEventSource && now >= self.next_rescan_ms {
            self.next_rescan_ms = now + self.config.degraded_rescan_ms;
            if let Err(err) = self.dispatcher.initial_scan(&self.targets) {
                warn!(error = %err, "degraded-mode rescan failed");
            }
        }
        if now >= self.next_stats_ms {
            self.next_stats_ms = now + self.config.stats_interval_ms;
            self.log_stats();
        }
        self.poll_config();
    }

    fn check_event_source(&mut self, now: u64) {
        let mode = self.shared.mode();
        if self.source.is_healthy() {
            if mode == OperationMode::DegradedEventSource {
                self.shared.set_mode(OperationMode::Normal);
                info!(source = self.source.name(), "event source recovered");
            }
            return;
        }

        warn!(source = self.source.name(), "event source unhealthy, restarting");
        let recovered = match self.source.restart() {
            Ok(()) => self.source.is_healthy(),
            Err(err) => {
                warn!(error = %err, "event source restart failed");
                false
            }
        };

        if recovered {
            if mode == OperationMode::DegradedEventSource {
                self.shared.set_mode(OperationMode::Normal);
            }
            info!(source = self.source.name(), "event source restarted");
        } else if mode == OperationMode::Normal {
            self.shared.set_mode(OperationMode::DegradedEventSource);
            self.next_rescan_ms = now;
            warn!("falling back to periodic snapshot rescans");
        }
    }

    fn log_stats(&self) {
        let stats = &self.shared.stats;
        let phases = self.shared.index.counts();
        debug!(
            tracked = self.dispatcher.len(),
            aggressive = phases.aggressive,
            stable = phases.stable,
            persistent = phases.persistent,
            violations = read(&stats.total_violations),
            wakeups_request = read(&stats.wakeup_enforcement_request),
            wakeups_exit = read(&stats.wakeup_process_exit),
            wakeups_safety = read(&stats.wakeup_safety_net),
            wakeups_config = read(&stats.wakeup_config_change),
            dropped = read(&stats.dropped_requests),
            "engine stats"
        );
    }

    /// Final exit handling, then dispatcher teardown.
    pub fn shutdown(&mut self) {
        for exit in self.channels.exits.try_iter() {
            self.dispatcher.on_exit(exit);
        }
        let released = self.dispatcher.shutdown();
        info!(released, "engine control loop stopped");
    }
}
