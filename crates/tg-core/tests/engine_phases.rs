//! Phase-machine integration tests.
//!
//! Drive the dispatcher through the harness with a manual clock and a
//! manual timer queue, so every transition is checked at its exact
//! deadline:
//! - aggressive verification and settling
//! - escalation to persistent enforcement and back
//! - thread-event, safety-net and exit handling
//! - reconciliation, grouping, self-healing, policy application

use tg_common::{OsError, Phase, ProcessId};
use tg_core::engine::shared::read;
use tg_core::engine::{EngineConfig, EnforcementRequest, ProcessStart, RequestKind};
use tg_core::platform::mock::MockPlatform;
use tg_core::test_utils::Harness;

const GAME: u32 = 100;

fn game_harness() -> Harness {
    let platform = MockPlatform::new().with_process(GAME, 1, "game.exe");
    Harness::new(platform).with_targets(&["game.exe"])
}

/// Track the game and let it settle (3000ms of clean verification).
fn settled_game() -> Harness {
    let mut h = game_harness();
    assert!(h.enforce_root(GAME, "game.exe"));
    h.advance(3_000);
    assert_eq!(h.phase(GAME), Some(Phase::Stable));
    h
}

/// Re-throttle before each of three verification steps.
fn persistent_game() -> Harness {
    let mut h = game_harness();
    assert!(h.enforce_root(GAME, "game.exe"));
    for _ in 0..3 {
        h.platform.rethrottle(GAME);
        h.advance(200);
    }
    assert_eq!(h.phase(GAME), Some(Phase::Persistent));
    h
}

// ============================================================================
// Aggressive phase
// ============================================================================

mod aggressive {
    use super::*;

    #[test]
    fn test_clean_process_pulsed_once_and_stable_after_three_seconds() {
        let mut h = game_harness();
        assert!(h.enforce_root(GAME, "game.exe"));
        assert_eq!(h.platform.force_calls(GAME), 1);
        assert_eq!(h.platform.thread_calls(GAME), 1);

        let view = h.view(GAME).unwrap();
        assert_eq!(view.phase, Phase::Aggressive);
        assert_eq!(view.deferred_step, 1);
        assert!(view.deferred_armed);

        h.advance(2_999);
        assert_eq!(h.phase(GAME), Some(Phase::Aggressive));
        assert_eq!(h.view(GAME).unwrap().deferred_step, 3);

        h.advance(1);
        let view = h.view(GAME).unwrap();
        assert_eq!(view.phase, Phase::Stable);
        assert!(!view.deferred_armed);
        assert_eq!(view.violations, 0);
        assert_eq!(h.platform.force_calls(GAME), 1);
        assert_eq!(h.timers.pending(), 0);
    }

    #[test]
    fn test_verification_steps_follow_configured_delays() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");

        h.advance(200);
        assert_eq!(h.view(GAME).unwrap().deferred_step, 2);
        h.advance(799);
        assert_eq!(h.view(GAME).unwrap().deferred_step, 2);
        h.advance(1);
        assert_eq!(h.view(GAME).unwrap().deferred_step, 3);
    }

    #[test]
    fn test_throttled_verification_restarts_at_step_one() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");
        h.advance(200);
        assert_eq!(h.view(GAME).unwrap().deferred_step, 2);

        h.platform.rethrottle(GAME);
        h.advance(800);

        let view = h.view(GAME).unwrap();
        assert_eq!(view.phase, Phase::Aggressive);
        assert_eq!(view.violations, 1);
        assert_eq!(view.deferred_step, 1);
        assert!(!h.platform.is_throttled(GAME));
        assert_eq!(h.platform.force_calls(GAME), 2);
        assert_eq!(read(&h.shared.stats.total_violations), 1);
    }

    #[test]
    fn test_thread_events_ignored_while_aggressive() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");
        h.platform.rethrottle(GAME);
        h.thread_event(GAME);
        assert_eq!(h.platform.force_calls(GAME), 1);
        assert_eq!(h.view(GAME).unwrap().violations, 0);
    }

    #[test]
    fn test_stale_verification_ticket_ignored() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");
        h.platform.rethrottle(GAME);

        h.dispatcher.dispatch(EnforcementRequest::new(
            ProcessId(GAME),
            RequestKind::DeferredVerify {
                step: 3,
                generation: 9_999,
            },
        ));

        let view = h.view(GAME).unwrap();
        assert_eq!(view.phase, Phase::Aggressive);
        assert_eq!(view.violations, 0);
        assert_eq!(view.deferred_step, 1);
        assert_eq!(h.platform.force_calls(GAME), 1);
    }
}

// ============================================================================
// Persistent phase
// ============================================================================

mod persistent {
    use super::*;

    #[test]
    fn test_three_violations_enter_persistent_with_five_second_timer() {
        let mut h = persistent_game();
        let view = h.view(GAME).unwrap();
        assert_eq!(view.violations, 3);
        assert!(view.persistent_armed);
        assert!(!view.deferred_armed);

        let entered = h.now();
        assert_eq!(h.timers.next_deadline(), Some(entered + 5_000));

        h.advance(4_999);
        assert_eq!(read(&h.shared.stats.persistent_applied), 0);
        h.advance(1);
        assert_eq!(read(&h.shared.stats.persistent_applied), 1);
        h.advance(5_000);
        assert_eq!(read(&h.shared.stats.persistent_applied), 2);
        assert_eq!(h.phase(GAME), Some(Phase::Persistent));
    }

    #[test]
    fn test_sixty_quiet_seconds_return_to_stable_and_cancel_timer() {
        let mut h = persistent_game();
        let entered = h.now();

        h.advance_to(entered + 59_999);
        assert_eq!(h.phase(GAME), Some(Phase::Persistent));

        h.advance_to(entered + 60_000);
        let view = h.view(GAME).unwrap();
        assert_eq!(view.phase, Phase::Stable);
        assert!(!view.persistent_armed);
        assert_eq!(h.timers.pending(), 0);
        // violations are history, not reset
        assert_eq!(view.violations, 3);
    }

    #[test]
    fn test_rethrottle_during_persistent_restarts_quiet_window() {
        let mut h = persistent_game();
        let entered = h.now();

        h.advance_to(entered + 30_000);
        h.platform.rethrottle(GAME);
        h.advance_to(entered + 35_000);
        assert!(!h.platform.is_throttled(GAME));

        h.advance_to(entered + 90_000);
        assert_eq!(h.phase(GAME), Some(Phase::Persistent));
        h.advance_to(entered + 95_000);
        assert_eq!(h.phase(GAME), Some(Phase::Stable));
        assert_eq!(h.view(GAME).unwrap().violations, 3);
    }

    #[test]
    fn test_thread_events_rate_limited_to_one_per_second() {
        let mut h = persistent_game();
        let calls = h.platform.force_calls(GAME);

        h.platform.rethrottle(GAME);
        h.thread_event(GAME);
        assert_eq!(h.platform.force_calls(GAME), calls + 1);

        h.platform.rethrottle(GAME);
        h.thread_event(GAME);
        assert_eq!(h.platform.force_calls(GAME), calls + 1);
        assert!(h.platform.is_throttled(GAME));

        h.advance(1_000);
        h.thread_event(GAME);
        assert_eq!(h.platform.force_calls(GAME), calls + 2);
        assert!(!h.platform.is_throttled(GAME));
        assert_eq!(h.view(GAME).unwrap().violations, 3);
    }

    #[test]
    fn test_tick_reopens_released_handle() {
        let mut h = persistent_game();
        h.platform.fail_query(GAME, Some(OsError::invalid_handle()));

        h.advance(5_000);
        assert!(!h.view(GAME).unwrap().has_handle);
        assert_eq!(read(&h.shared.stats.persistent_skipped), 1);

        h.platform.fail_query(GAME, None);
        h.platform.rethrottle(GAME);
        let calls = h.platform.force_calls(GAME);
        h.advance(5_000);

        let view = h.view(GAME).unwrap();
        assert!(view.has_handle);
        assert_eq!(view.phase, Phase::Persistent);
        assert!(view.persistent_armed);
        assert!(!h.platform.is_throttled(GAME));
        assert_eq!(h.platform.force_calls(GAME), calls + 1);
        assert_eq!(read(&h.shared.stats.handle_reopens), 1);
        assert_eq!(read(&h.shared.stats.persistent_applied), 1);
    }

    #[test]
    fn test_released_process_stays_enforced_across_safety_nets() {
        let mut h = persistent_game();
        h.platform.fail_query(GAME, Some(OsError::invalid_handle()));
        h.advance(5_000);
        h.platform.fail_query(GAME, None);
        h.platform.rethrottle(GAME);

        for _ in 0..12 {
            h.advance(10_000);
            h.safety_net();
        }
        assert!(h.view(GAME).unwrap().has_handle);
        assert!(!h.platform.is_throttled(GAME));
    }

    #[test]
    fn test_tick_skipped_while_handle_cannot_reopen() {
        let mut h = persistent_game();
        h.platform.fail_query(GAME, Some(OsError::invalid_handle()));
        h.advance(5_000);
        h.platform.fail_open(GAME, OsError::access_denied());

        h.advance(5_000);
        assert!(!h.view(GAME).unwrap().has_handle);
        assert_eq!(read(&h.shared.stats.persistent_skipped), 2);
        assert_eq!(read(&h.shared.stats.persistent_applied), 0);
        assert_eq!(h.timers.pending(), 1);
    }

    #[test]
    fn test_thread_event_reopens_released_handle() {
        let mut h = persistent_game();
        h.platform.fail_query(GAME, Some(OsError::invalid_handle()));
        h.advance(5_000);
        h.platform.fail_query(GAME, None);
        h.platform.rethrottle(GAME);

        h.advance(1_000);
        h.thread_event(GAME);
        assert!(h.view(GAME).unwrap().has_handle);
        assert!(!h.platform.is_throttled(GAME));
    }
}

// ============================================================================
// Stable phase: thread events and safety net
// ============================================================================

mod stable {
    use super::*;

    #[test]
    fn test_thread_event_on_throttled_stable_process_escalates() {
        let mut h = settled_game();
        h.platform.rethrottle(GAME);
        h.thread_event(GAME);

        let view = h.view(GAME).unwrap();
        assert_eq!(view.phase, Phase::Aggressive);
        assert_eq!(view.violations, 1);
        assert_eq!(view.deferred_step, 1);
        assert!(!h.platform.is_throttled(GAME));
    }

    #[test]
    fn test_thread_event_on_clean_stable_process_is_quiet() {
        let mut h = settled_game();
        h.thread_event(GAME);
        assert_eq!(h.phase(GAME), Some(Phase::Stable));
        assert_eq!(h.platform.force_calls(GAME), 1);
    }

    #[test]
    fn test_third_violation_from_stable_goes_persistent() {
        let mut h = settled_game();
        for expected in 1..=2 {
            h.platform.rethrottle(GAME);
            h.thread_event(GAME);
            assert_eq!(h.view(GAME).unwrap().violations, expected);
            h.advance(3_000);
            assert_eq!(h.phase(GAME), Some(Phase::Stable));
        }
        h.platform.rethrottle(GAME);
        h.safety_net();
        assert_eq!(h.phase(GAME), Some(Phase::Persistent));
    }

    #[test]
    fn test_safety_net_catches_rethrottle() {
        let mut h = settled_game();
        h.platform.rethrottle(GAME);
        assert_eq!(h.safety_net(), 1);
        assert_eq!(h.phase(GAME), Some(Phase::Aggressive));
        assert_eq!(h.view(GAME).unwrap().violations, 1);
    }

    #[test]
    fn test_safety_net_reopens_released_handle() {
        let mut h = settled_game();
        h.platform.fail_query(GAME, Some(OsError::invalid_handle()));
        h.safety_net();
        assert!(!h.view(GAME).unwrap().has_handle);
        assert_eq!(read(&h.shared.stats.errors_invalid_handle), 1);

        h.platform.fail_query(GAME, None);
        h.platform.rethrottle(GAME);
        h.safety_net();

        let view = h.view(GAME).unwrap();
        assert!(view.has_handle);
        assert_eq!(view.phase, Phase::Aggressive);
        assert_eq!(read(&h.shared.stats.handle_reopens), 1);
    }

    #[test]
    fn test_full_request_queue_counts_drops() {
        let platform = MockPlatform::new()
            .with_process(100, 1, "game.exe")
            .with_process(200, 1, "editor.exe");
        let config = EngineConfig {
            request_queue_capacity: 1,
            ..EngineConfig::default()
        };
        let mut h = Harness::with_config(platform, config);
        h.enforce_root(100, "game.exe");
        h.advance(1_000);
        h.enforce_root(200, "editor.exe");
        h.advance(3_000);
        assert_eq!(h.phase(100), Some(Phase::Stable));
        assert_eq!(h.phase(200), Some(Phase::Stable));

        assert_eq!(h.dispatcher.safety_net(), 1);
        assert_eq!(read(&h.shared.stats.dropped_requests), 1);
    }
}

// ============================================================================
// Exits, starts, reconciliation
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_exit_racing_safety_net_removes_once() {
        let mut h = settled_game();
        h.platform.exit(GAME);
        h.dispatcher.safety_net();
        h.pump();

        assert!(!h.is_tracked(GAME));
        assert!(h.shared.index.is_empty());
        assert!(h.dispatcher.groups().is_empty());
        assert_eq!(h.platform.watches_dropped(), 1);
        assert!(!h.dispatcher.remove(ProcessId(GAME)));
    }

    #[test]
    fn test_lost_exit_notification_recovered_by_safety_net() {
        let mut h = settled_game();
        h.platform.kill_silently(GAME);
        h.safety_net();

        assert!(!h.is_tracked(GAME));
        assert_eq!(h.platform.watches_dropped(), 1);
    }

    #[test]
    fn test_exit_releases_timers() {
        let mut h = persistent_game();
        h.platform.exit(GAME);
        h.pump();
        assert!(!h.is_tracked(GAME));
        assert_eq!(h.timers.pending(), 0);
    }

    #[test]
    fn test_start_event_tracks_targets_and_descendants() {
        let platform = MockPlatform::new();
        let mut h = Harness::new(platform.clone()).with_targets(&["Game.EXE"]);

        platform.spawn(300, 1, "notepad.exe");
        assert!(!h.start(300, 1, "notepad.exe"));

        platform.spawn(100, 1, "game.exe");
        assert!(h.start(100, 1, "GAME.exe"));
        platform.spawn(101, 100, "helper.exe");
        assert!(h.start(101, 100, "helper.exe"));
        platform.spawn(102, 101, "render.exe");
        assert!(h.start(102, 101, "render.exe"));

        let grandchild = h.view(102).unwrap();
        assert!(grandchild.is_child);
        assert_eq!(grandchild.root, ProcessId(100));
        assert!(!h.view(100).unwrap().is_child);
        assert_eq!(h.dispatcher.len(), 3);
    }

    #[test]
    fn test_critical_processes_never_tracked() {
        let platform = MockPlatform::new()
            .with_process(100, 1, "game.exe")
            .with_process(101, 100, "svchost.exe")
            .with_process(4, 0, "System");
        let mut h = Harness::new(platform).with_targets(&["game.exe"]);

        assert!(h.start(100, 1, "game.exe"));
        assert!(!h.start(101, 100, "svchost.exe"));
        assert!(!h.dispatcher.enforce(ProcessId(4), ProcessId(0), "System", None));
        assert_eq!(h.dispatcher.len(), 1);
    }

    #[test]
    fn test_reused_pid_with_new_image_replaces_record() {
        let mut h = game_harness();
        assert!(h.start(GAME, 1, "game.exe"));

        h.platform.reap(GAME);
        h.platform.spawn(GAME, 1, "other.exe");
        assert!(!h.start(GAME, 1, "other.exe"));
        assert!(!h.is_tracked(GAME));
    }

    #[test]
    fn test_stale_exit_for_recycled_pid_keeps_new_process() {
        let mut h = game_harness().with_targets(&["editor.exe"]);
        assert!(h.enforce_root(GAME, "game.exe"));

        // exit is queued but the start for the recycled pid is handled first
        h.platform.exit(GAME);
        h.platform.spawn(GAME, 1, "editor.exe");
        let event = ProcessStart {
            pid: ProcessId(GAME),
            parent: ProcessId(1),
            image: "editor.exe".to_string(),
        };
        assert!(h.dispatcher.on_process_start(&event, &h.targets));
        h.pump();

        let view = h.view(GAME).expect("recycled pid should stay tracked");
        assert_eq!(view.image, "editor.exe");
        assert_eq!(view.phase, Phase::Aggressive);
        assert!(h.platform.has_exit_watch(GAME));
    }

    #[test]
    fn test_same_image_on_recycled_pid_is_retracked() {
        let mut h = game_harness();
        assert!(h.enforce_root(GAME, "game.exe"));
        h.advance(3_000);

        h.platform.exit(GAME);
        h.platform.spawn(GAME, 1, "game.exe");
        let event = ProcessStart {
            pid: ProcessId(GAME),
            parent: ProcessId(1),
            image: "game.exe".to_string(),
        };
        assert!(h.dispatcher.on_process_start(&event, &h.targets));
        h.pump();

        let view = h.view(GAME).expect("new instance should be tracked");
        assert_eq!(view.phase, Phase::Aggressive);
        assert!(view.has_handle);
        assert_eq!(h.platform.watches_dropped(), 1);
    }

    #[test]
    fn test_exit_after_restart_still_removes() {
        let mut h = game_harness();
        assert!(h.start(GAME, 1, "game.exe"));
        h.platform.exit(GAME);
        h.pump();
        assert!(!h.is_tracked(GAME));

        h.platform.spawn(GAME, 1, "game.exe");
        assert!(h.start(GAME, 1, "game.exe"));
        h.platform.exit(GAME);
        h.pump();
        assert!(!h.is_tracked(GAME));
    }

    #[test]
    fn test_reconciliation_keeps_children_whose_names_are_targets() {
        let platform = MockPlatform::new()
            .with_process(100, 1, "launcher.exe")
            .with_child(101, 100, "game.exe")
            .with_child(102, 100, "helper.exe");
        let mut h = Harness::new(platform).with_targets(&["launcher.exe", "game.exe"]);
        h.start(100, 1, "launcher.exe");
        h.start(101, 100, "game.exe");
        h.start(102, 100, "helper.exe");
        assert!(h.view(101).unwrap().is_child);
        assert_eq!(h.dispatcher.len(), 3);

        let targets = ["game.exe".to_string()].into_iter().collect();
        let outcome = h.dispatcher.reconcile(&targets);

        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.added, 0);
        assert!(h.is_tracked(101));
        assert!(!h.is_tracked(100));
        assert!(!h.is_tracked(102));
        // reconciliation never removes persistent policies
        assert!(h.ledger().is_applied("launcher.exe"));
    }

    #[test]
    fn test_reconciliation_adds_new_targets_and_their_trees() {
        let platform = MockPlatform::new()
            .with_process(100, 1, "game.exe")
            .with_process(200, 1, "editor.exe")
            .with_child(201, 200, "plugin-host.exe")
            .with_child(202, 201, "worker.exe");
        let mut h = Harness::new(platform).with_targets(&["game.exe"]);
        assert_eq!(h.dispatcher.initial_scan(&h.targets.clone()).unwrap(), 1);

        let targets = ["game.exe".to_string(), "editor.exe".to_string()]
            .into_iter()
            .collect();
        let outcome = h.dispatcher.reconcile(&targets);
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.added, 3);
        assert_eq!(h.view(202).unwrap().root, ProcessId(200));
    }
}

// ============================================================================
// Grouping
// ============================================================================

mod grouping {
    use super::*;

    #[test]
    fn test_root_assigned_to_owned_group() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");
        let view = h.view(GAME).unwrap();
        assert!(view.in_group);
        assert!(!view.group_assignment_failed);
        assert_eq!(h.platform.group_members(), vec![vec![GAME]]);
    }

    #[test]
    fn test_sandboxed_root_marks_assignment_failed() {
        let mut h = game_harness();
        h.platform.set_foreign_group(GAME);
        assert!(h.enforce_root(GAME, "game.exe"));

        let view = h.view(GAME).unwrap();
        assert!(!view.in_group);
        assert!(view.group_assignment_failed);
        assert_eq!(h.platform.group_count(), 0);
        assert_eq!(h.platform.force_calls(GAME), 1);
    }

    #[test]
    fn test_group_creation_failure_still_enforces() {
        let mut h = game_harness();
        h.platform.fail_groups(OsError::access_denied());
        assert!(h.enforce_root(GAME, "game.exe"));
        assert!(h.view(GAME).unwrap().group_assignment_failed);
        assert_eq!(h.platform.force_calls(GAME), 1);
    }

    #[test]
    fn test_group_refresh_enforces_missed_descendants() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");

        h.platform.spawn(105, GAME, "worker.exe");
        h.platform.join_group(0, 105);
        assert_eq!(h.dispatcher.refresh_groups(), 1);

        let view = h.view(105).unwrap();
        assert!(view.is_child);
        assert_eq!(view.root, ProcessId(GAME));
        assert_eq!(h.dispatcher.refresh_groups(), 0);
    }
}

// ============================================================================
// Self-healing
// ============================================================================

mod healing {
    use super::*;

    #[test]
    fn test_transient_failures_retry_with_backoff() {
        let mut h = game_harness();
        h.platform
            .fail_force(GAME, &[OsError::new(1450), OsError::new(1450)]);
        h.enforce_root(GAME, "game.exe");
        assert!(h.view(GAME).unwrap().retry_armed);
        assert_eq!(h.view(GAME).unwrap().consecutive_failures, 1);

        h.advance(50);
        assert_eq!(h.platform.force_calls(GAME), 2);
        h.advance(99);
        assert_eq!(h.platform.force_calls(GAME), 2);
        h.advance(1);
        assert_eq!(h.platform.force_calls(GAME), 3);

        let view = h.view(GAME).unwrap();
        assert_eq!(view.consecutive_failures, 0);
        assert!(!view.retry_armed);
        assert_eq!(read(&h.shared.stats.retries), 2);
        assert_eq!(read(&h.shared.stats.errors_other), 2);
    }

    #[test]
    fn test_access_denied_gives_up_after_two_retries() {
        let mut h = game_harness();
        h.platform.fail_force(GAME, &[OsError::access_denied(); 4]);
        h.enforce_root(GAME, "game.exe");
        h.advance(150);

        let view = h.view(GAME).unwrap();
        assert_eq!(h.platform.force_calls(GAME), 3);
        assert_eq!(view.consecutive_failures, 3);
        assert!(!view.retry_armed);
        assert!(view.has_handle);
        assert_eq!(read(&h.shared.stats.errors_access_denied), 3);
    }

    #[test]
    fn test_invalid_handle_releases_without_retry() {
        let mut h = game_harness();
        h.platform.fail_force(GAME, &[OsError::invalid_handle()]);
        h.enforce_root(GAME, "game.exe");

        let view = h.view(GAME).unwrap();
        assert!(!view.has_handle);
        assert!(!view.retry_armed);
        assert_eq!(read(&h.shared.stats.retries), 0);
        assert!(h.is_tracked(GAME));
    }

    #[test]
    fn test_open_failure_leaves_process_untracked() {
        let mut h = game_harness();
        h.platform.fail_open(GAME, OsError::access_denied());
        assert!(!h.enforce_root(GAME, "game.exe"));
        assert!(h.dispatcher.is_empty());
        assert_eq!(read(&h.shared.stats.errors_access_denied), 1);
    }
}

// ============================================================================
// Persistent policies
// ============================================================================

mod policies {
    use super::*;

    #[test]
    fn test_root_enforcement_applies_policies_once() {
        let mut h = game_harness();
        h.enforce_root(GAME, "game.exe");

        assert!(h.ledger().is_applied("game.exe"));
        assert!(h.policies.has_exclusion("C:\\Program Files\\Mock\\game.exe"));
        assert!(h.policies.has_override("game.exe"));
        assert!(h.ledger().manifest_path().exists());

        h.platform.exit(GAME);
        h.pump();
        h.platform.spawn(110, 1, "game.exe");
        assert!(h.start(110, 1, "game.exe"));
        assert_eq!(h.policies.set_calls(), 2);
    }

    #[test]
    fn test_children_do_not_apply_policies() {
        let mut h = game_harness();
        h.start(GAME, 1, "game.exe");
        h.platform.spawn(101, GAME, "helper.exe");
        h.start(101, GAME, "helper.exe");

        assert!(!h.ledger().is_applied("helper.exe"));
        assert_eq!(h.ledger().list(), vec!["game.exe".to_string()]);
    }

    #[test]
    fn test_shutdown_releases_everything_but_keeps_ledger() {
        let mut h = persistent_game();
        h.platform.spawn(101, GAME, "helper.exe");
        h.start(101, GAME, "helper.exe");

        assert_eq!(h.dispatcher.shutdown(), 2);
        assert!(h.dispatcher.is_empty());
        assert!(h.shared.index.is_empty());
        assert!(h.dispatcher.groups().is_empty());
        assert_eq!(h.platform.watches_dropped(), 2);
        assert!(h.ledger().is_applied("game.exe"));

        assert_eq!(h.ledger().remove_all().unwrap(), 1);
        assert!(h.policies.is_empty());
    }
}
