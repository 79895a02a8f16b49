//! Operator-facing health snapshot.

use crate::engine::shared::{read, EngineShared};
use serde::{Deserialize, Serialize};
use tg_common::OperationMode;

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub aggressive: usize,
    pub stable: usize,
    pub persistent: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSourceSummary {
    pub healthy: bool,
    pub event_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupCounters {
    pub config_change: u64,
    pub safety_net: u64,
    pub enforcement_request: u64,
    pub process_exit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementCounters {
    pub persistent_applied: u64,
    pub persistent_skipped: u64,
    pub retries: u64,
    pub handle_reopens: u64,
    pub dropped_requests: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub access_denied: u64,
    pub invalid_parameter: u64,
    pub invalid_handle: u64,
    pub other: u64,
    pub shutdown_warnings: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCounters {
    pub changes_detected: u64,
    pub reloads: u64,
}

/// Point-in-time engine health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub engine_running: bool,
    pub mode: OperationMode,
    pub uptime_ms: u64,
    pub active_processes: usize,
    pub phases: PhaseSummary,
    pub total_violations: u64,
    pub event_source: EventSourceSummary,
    pub wakeups: WakeupCounters,
    pub enforcement: EnforcementCounters,
    pub errors: ErrorCounters,
    pub config: ConfigCounters,
}

impl HealthSnapshot {
    /// Build from shared engine state plus what only the owner knows.
    pub fn collect(shared: &EngineShared, event_source: EventSourceSummary, uptime_ms: u64) -> Self {
        let stats = &shared.stats;
        let counts = shared.index.counts();
        let engine_running = shared.is_running();
        let mode = shared.mode();

        let status = if !engine_running {
            HealthStatus::Unhealthy
        } else if !event_source.healthy || mode != OperationMode::Normal {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            engine_running,
            mode,
            uptime_ms,
            active_processes: counts.total(),
            phases: PhaseSummary {
                aggressive: counts.aggressive,
                stable: counts.stable,
                persistent: counts.persistent,
            },
            total_violations: read(&stats.total_violations),
            event_source,
            wakeups: WakeupCounters {
                config_change: read(&stats.wakeup_config_change),
                safety_net: read(&stats.wakeup_safety_net),
                enforcement_request: read(&stats.wakeup_enforcement_request),
                process_exit: read(&stats.wakeup_process_exit),
            },
            enforcement: EnforcementCounters {
                persistent_applied: read(&stats.persistent_applied),
                persistent_skipped: read(&stats.persistent_skipped),
                retries: read(&stats.retries),
                handle_reopens: read(&stats.handle_reopens),
                dropped_requests: read(&stats.dropped_requests),
            },
            errors: ErrorCounters {
                access_denied: read(&stats.errors_access_denied),
                invalid_parameter: read(&stats.errors_invalid_parameter),
                invalid_handle: read(&stats.errors_invalid_handle),
                other: read(&stats.errors_other),
                shutdown_warnings: read(&stats.shutdown_warnings),
            },
            config: ConfigCounters {
                changes_detected: read(&stats.config_changes_detected),
                reloads: read(&stats.config_reloads),
            },
        }
    }
}
