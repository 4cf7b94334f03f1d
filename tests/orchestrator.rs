#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use chrono::{DateTime, TimeZone, Utc};
    use presenced::db::patterns::{MemoryPatterns, PatternStore};
    use presenced::db::transitions::{MemoryTransitions, TransitionStore};
    use presenced::libs::background::{SensorKind, Signal};
    use presenced::libs::clock::ManualClock;
    use presenced::libs::config::PresenceConfig;
    use presenced::libs::error::PresenceError;
    use presenced::libs::orchestrator::PresenceOrchestrator;
    use presenced::libs::presence::{PresenceContext, SourceKind, TransitionRecord, UnifiedPresenceRecord, UnifiedPresenceState};
    use presenced::libs::probe::SignalProbe;
    use presenced::libs::session::InteractionKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const USER: &str = "alice";
    const SESSION: &str = "web-1";

    /// Append fails while `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        failing: AtomicBool,
        inner: MemoryTransitions,
    }

    impl TransitionStore for FlakyStore {
        fn append(&self, record: &TransitionRecord) -> Result<i64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("disk full"));
            }
            self.inner.append(record)
        }

        fn history(&self, user_id: &str, limit: usize) -> Result<Vec<TransitionRecord>> {
            self.inner.history(user_id, limit)
        }

        fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
            self.inner.prune_older_than(cutoff)
        }
    }

    struct Harness {
        clock: ManualClock,
        store: Arc<MemoryTransitions>,
        orchestrator: PresenceOrchestrator,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());
            let store = Arc::new(MemoryTransitions::new());
            let orchestrator = PresenceOrchestrator::new(PresenceConfig::default(), Arc::new(clock.clone()), store.clone());
            Self { clock, store, orchestrator }
        }

        /// Runs, in order, what the aggregate, idle and fusion loops would run.
        fn tick(&self) -> UnifiedPresenceRecord {
            self.orchestrator.background_sensor().aggregate(USER);
            self.orchestrator.idle_monitor().reevaluate(USER);
            self.orchestrator.run_cycle(USER).expect("user is monitored")
        }

        fn interact(&self, kind: InteractionKind) {
            assert_eq!(self.orchestrator.record_interaction(USER, kind, None), Ok(true));
        }
    }

    #[tokio::test]
    async fn test_twenty_minutes_of_silence_ends_away() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        assert_eq!(
            h.orchestrator.get_unified_presence(USER).unwrap().state,
            UnifiedPresenceState::Unknown
        );

        h.interact(InteractionKind::Message);
        let record = h.tick();
        assert_eq!(record.state, UnifiedPresenceState::ActivelyPresent);
        assert_eq!(record.context, PresenceContext::FocusedSession);
        assert!((record.confidence - 1.0).abs() < 1e-9);

        h.clock.advance_secs(120);
        let record = h.tick();
        assert_eq!(record.state, UnifiedPresenceState::PassivelyPresent);
        assert_eq!(record.context, PresenceContext::CasualBrowsing);

        h.clock.advance_secs(1080);
        let record = h.tick();
        assert_eq!(record.state, UnifiedPresenceState::Away);
        assert_eq!(record.context, PresenceContext::BreakTime);
        assert_eq!(record.predicted_return_minutes, Some(10.0));
        assert!((record.confidence - 0.7).abs() < 1e-9);
        assert_eq!(record.contributing_sources, vec![SourceKind::Session, SourceKind::Idle]);

        let history = h.orchestrator.history(USER, 10).unwrap();
        let states: Vec<_> = history.iter().map(|t| (t.from_state, t.to_state)).collect();
        assert_eq!(
            states,
            vec![
                (UnifiedPresenceState::Unknown, UnifiedPresenceState::ActivelyPresent),
                (UnifiedPresenceState::ActivelyPresent, UnifiedPresenceState::PassivelyPresent),
                (UnifiedPresenceState::PassivelyPresent, UnifiedPresenceState::Away),
            ]
        );
        assert!((history[1].duration_secs - 120.0).abs() < 1e-9);
        assert!((history[2].duration_secs - 1080.0).abs() < 1e-9);
        assert_eq!(history[2].metadata["session_id"], json!(SESSION));
        assert_eq!(history[2].metadata["predicted_return_minutes"], json!(10.0));

        let last = h.orchestrator.stop_monitoring(USER).await.unwrap();
        assert_eq!(last.state, UnifiedPresenceState::Away);
    }

    #[tokio::test]
    async fn test_exactly_one_transition_per_state_change() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        h.interact(InteractionKind::Message);

        for _ in 0..3 {
            h.tick();
        }
        h.clock.advance_secs(10);
        h.tick();

        assert_eq!(h.store.len(), 1);
        let record = h.orchestrator.get_unified_presence(USER).unwrap();
        assert_eq!(record.state, UnifiedPresenceState::ActivelyPresent);
        assert!((record.duration_in_state_secs - 10.0).abs() < 1e-9);

        h.orchestrator.stop_monitoring(USER).await;
    }

    #[tokio::test]
    async fn test_stopped_user_ignores_writes() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        h.interact(InteractionKind::Message);
        h.tick();

        let last = h.orchestrator.stop_monitoring(USER).await;
        assert!(last.is_some());
        let stored = h.store.len();

        assert!(!h.orchestrator.is_monitoring(USER));
        assert_eq!(h.orchestrator.record_interaction(USER, InteractionKind::Click, None), Ok(false));
        assert!(h.orchestrator.run_cycle(USER).is_none());
        assert!(h.orchestrator.get_unified_presence(USER).is_none());
        assert!(h.orchestrator.stop_monitoring(USER).await.is_none());
        assert!(!h.orchestrator.session_tracker().is_tracking(SESSION));
        assert!(!h.orchestrator.idle_monitor().is_monitoring(USER));
        assert!(!h.orchestrator.background_sensor().is_monitoring(USER));
        assert_eq!(h.store.len(), stored);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_state_changes() {
        let h = Harness::new();
        assert_eq!(
            h.orchestrator.start_monitoring(" ", SESSION),
            Err(PresenceError::EmptyIdentifier("user id"))
        );
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();

        let result = h
            .orchestrator
            .record_interaction(USER, InteractionKind::Message, Some(json!(["not", "an", "object"])));
        assert_eq!(result, Err(PresenceError::InvalidMetadata));
        assert_eq!(h.orchestrator.session_tracker().snapshot(SESSION).unwrap().interaction_count, 0);
        assert_eq!(h.orchestrator.background_sensor().reading_count(USER), 0);

        assert_eq!(
            h.orchestrator.record_interaction("", InteractionKind::Message, None),
            Err(PresenceError::EmptyIdentifier("user id"))
        );
        assert_eq!(
            h.orchestrator
                .record_interaction(USER, InteractionKind::Click, Some(json!({"target": "send"}))),
            Ok(true)
        );

        h.orchestrator.stop_monitoring(USER).await;
    }

    #[tokio::test]
    async fn test_unpersisted_transitions_are_retried_in_order() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());
        let store = Arc::new(FlakyStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let orchestrator = PresenceOrchestrator::new(PresenceConfig::default(), Arc::new(clock.clone()), store.clone());

        orchestrator.start_monitoring(USER, SESSION).unwrap();
        orchestrator.record_interaction(USER, InteractionKind::Message, None).unwrap();
        orchestrator.run_cycle(USER);
        clock.advance_secs(120);
        orchestrator.run_cycle(USER);

        assert_eq!(orchestrator.pending_transitions(USER), 2);
        assert!(store.inner.is_empty());

        store.failing.store(false, Ordering::SeqCst);
        orchestrator.run_cycle(USER);

        assert_eq!(orchestrator.pending_transitions(USER), 0);
        let persisted = store.inner.all();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].from_state, UnifiedPresenceState::Unknown);
        assert_eq!(persisted[1].from_state, persisted[0].to_state);

        orchestrator.stop_monitoring(USER).await;
    }

    #[tokio::test]
    async fn test_observers_are_isolated_and_survive_restart() {
        let h = Harness::new();
        let seen = Arc::new(AtomicUsize::new(0));

        h.orchestrator
            .on_transition(USER, |_| panic!("observer bug"))
            .unwrap();
        let counter = seen.clone();
        h.orchestrator
            .on_transition(USER, move |transition| {
                assert_eq!(transition.user_id, USER);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        h.interact(InteractionKind::Voice);
        h.tick();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.len(), 1);

        h.orchestrator.stop_monitoring(USER).await;
        h.orchestrator.start_monitoring(USER, "web-2").unwrap();
        h.interact(InteractionKind::Voice);
        h.tick();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        h.orchestrator.shutdown().await;
        assert!(h.orchestrator.monitored_users().is_empty());
    }

    #[tokio::test]
    async fn test_start_again_switches_session() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, "web-1").unwrap();
        h.orchestrator.start_monitoring(USER, "web-2").unwrap();

        assert!(!h.orchestrator.session_tracker().is_tracking("web-1"));
        assert!(h.orchestrator.session_tracker().is_tracking("web-2"));
        assert_eq!(h.orchestrator.get_unified_presence(USER).unwrap().session_id, "web-2");
        assert_eq!(h.orchestrator.monitored_users(), vec![USER.to_string()]);

        h.orchestrator.stop_monitoring(USER).await;
    }

    #[tokio::test]
    async fn test_expired_session_restarts_on_interaction() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        h.interact(InteractionKind::Message);

        h.clock.advance_secs(1900);
        let record = h.tick();
        assert!(!record.contributing_sources.contains(&SourceKind::Session));
        assert!(!h.orchestrator.session_tracker().is_tracking(SESSION));

        h.interact(InteractionKind::Message);
        let snapshot = h.orchestrator.session_tracker().snapshot(SESSION).unwrap();
        assert_eq!(snapshot.interaction_count, 1);

        h.orchestrator.stop_monitoring(USER).await;
    }

    #[tokio::test]
    async fn test_learned_pattern_survives_stop_and_start() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());
        let patterns = Arc::new(MemoryPatterns::new());
        let orchestrator =
            PresenceOrchestrator::new(PresenceConfig::default(), Arc::new(clock.clone()), Arc::new(MemoryTransitions::new()))
                .with_pattern_store(patterns.clone());

        orchestrator.start_monitoring(USER, SESSION).unwrap();
        for _ in 0..120 {
            orchestrator.record_interaction(USER, InteractionKind::Typing, None).unwrap();
            clock.advance_secs(30);
        }
        // Twenty minutes away, then back.
        clock.advance_secs(1170);
        orchestrator.record_interaction(USER, InteractionKind::Message, None).unwrap();
        clock.advance_secs(5);
        orchestrator.idle_monitor().reevaluate(USER);

        let learned = orchestrator.idle_monitor().pattern(USER).unwrap();
        assert!((learned.preferred_break_minutes.unwrap() - 20.0).abs() < 0.1);
        assert!((learned.typical_session_minutes.unwrap() - 59.5).abs() < 0.1);

        orchestrator.stop_monitoring(USER).await;
        assert_eq!(patterns.load(USER).unwrap(), Some(learned.clone()));

        orchestrator.start_monitoring(USER, "web-2").unwrap();
        assert_eq!(orchestrator.idle_monitor().pattern(USER), Some(learned));

        orchestrator.stop_monitoring(USER).await;
    }

    #[test]
    fn test_cycles_can_be_driven_without_a_runtime() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        h.interact(InteractionKind::Scroll);
        let record = h.tick();
        assert_ne!(record.state, UnifiedPresenceState::Unknown);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_history_uses_retention() {
        let h = Harness::new();
        h.orchestrator.start_monitoring(USER, SESSION).unwrap();
        h.interact(InteractionKind::Message);
        h.tick();
        h.orchestrator.stop_monitoring(USER).await;

        h.clock.advance_secs(31 * 86_400);
        assert_eq!(h.orchestrator.prune_history().unwrap(), 1);
        assert!(h.store.is_empty());
    }

    // === Periodic workers ===

    /// Every loop ticks once a second.
    fn fast_config() -> PresenceConfig {
        let mut config = PresenceConfig::default();
        config.sensor.sample_interval_secs = 1;
        config.sensor.aggregate_interval_secs = 1;
        config.idle.reevaluate_interval_secs = 1;
        config.fusion.interval_secs = 1;
        config
    }

    fn start_clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap())
    }

    /// Polls `done` for up to five seconds.
    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    /// Flags when a sample begins, then holds the sampling thread.
    struct SlowProbe {
        sampling: AtomicBool,
        hold: Duration,
    }

    impl SignalProbe for SlowProbe {
        fn name(&self) -> &str {
            "slow"
        }

        fn sample(&self) -> std::result::Result<Vec<(SensorKind, Signal)>, PresenceError> {
            self.sampling.store(true, Ordering::SeqCst);
            std::thread::sleep(self.hold);
            Ok(vec![(SensorKind::SystemActivity, Signal::Level(0.8))])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fusion_worker_records_transitions() {
        let clock = start_clock();
        let store = Arc::new(MemoryTransitions::new());
        let orchestrator = PresenceOrchestrator::new(fast_config(), Arc::new(clock.clone()), store.clone());

        orchestrator.start_monitoring(USER, SESSION).unwrap();
        orchestrator.record_interaction(USER, InteractionKind::Message, None).unwrap();

        assert!(wait_until(|| !store.is_empty()).await, "fusion worker never produced a transition");
        let record = orchestrator.get_unified_presence(USER).unwrap();
        assert_ne!(record.state, UnifiedPresenceState::Unknown);
        assert!(record.contributing_sources.contains(&SourceKind::Session));

        let first = &store.all()[0];
        assert_eq!(first.from_state, UnifiedPresenceState::Unknown);
        assert_eq!(first.metadata["session_id"], json!(SESSION));

        assert!(orchestrator.stop_monitoring(USER).await.is_some());
        let stored = store.len();
        clock.advance_secs(1200);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.len(), stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_is_rejected_until_teardown_finishes() {
        let clock = start_clock();
        let probe = Arc::new(SlowProbe {
            sampling: AtomicBool::new(false),
            hold: Duration::from_millis(600),
        });
        let probes: Vec<Arc<dyn SignalProbe>> = vec![probe.clone()];
        let orchestrator =
            PresenceOrchestrator::with_probes(fast_config(), Arc::new(clock.clone()), Arc::new(MemoryTransitions::new()), probes);

        orchestrator.start_monitoring(USER, "web-1").unwrap();
        assert!(wait_until(|| probe.sampling.load(Ordering::SeqCst)).await, "sampling never started");

        // The stop has to wait for the sample in flight.
        let stopping = orchestrator.clone();
        let stop = tokio::spawn(async move { stopping.stop_monitoring(USER).await });
        assert!(wait_until(|| !orchestrator.is_monitoring(USER)).await);

        assert_eq!(
            orchestrator.start_monitoring(USER, "web-2"),
            Err(PresenceError::StopInProgress(USER.to_string()))
        );
        assert_eq!(orchestrator.record_interaction(USER, InteractionKind::Click, None), Ok(false));
        assert!(orchestrator.monitored_users().is_empty());

        assert!(stop.await.unwrap().is_some());
        assert!(!orchestrator.idle_monitor().is_monitoring(USER));

        orchestrator.start_monitoring(USER, "web-2").unwrap();
        assert!(orchestrator.is_monitoring(USER));
        assert!(orchestrator.idle_monitor().is_monitoring(USER));
        assert!(orchestrator.background_sensor().is_monitoring(USER));
        assert!(orchestrator.session_tracker().is_tracking("web-2"));

        assert_eq!(orchestrator.record_interaction(USER, InteractionKind::Message, None), Ok(true));
        orchestrator.background_sensor().aggregate(USER);
        let record = orchestrator.run_cycle(USER).unwrap();
        assert!(record.contributing_sources.contains(&SourceKind::Idle));
        assert!(record.contributing_sources.contains(&SourceKind::Background));

        orchestrator.stop_monitoring(USER).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_start_keeps_running_workers() {
        let clock = start_clock();
        let store = Arc::new(MemoryTransitions::new());
        let orchestrator = PresenceOrchestrator::new(fast_config(), Arc::new(clock.clone()), store.clone());

        let starters: Vec<_> = (0..4)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.start_monitoring(USER, SESSION) })
            })
            .collect();
        for starter in starters {
            assert_eq!(starter.await.unwrap(), Ok(()));
        }
        assert_eq!(orchestrator.monitored_users(), vec![USER.to_string()]);

        orchestrator.record_interaction(USER, InteractionKind::Message, None).unwrap();
        assert!(wait_until(|| !store.is_empty()).await);
        orchestrator.stop_monitoring(USER).await;

        // Any worker left behind by an overwritten start would still append.
        let stored = store.len();
        clock.advance_secs(1200);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.len(), stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_and_cycles_keep_records_whole() {
        let clock = start_clock();
        let store = Arc::new(MemoryTransitions::new());
        let orchestrator = PresenceOrchestrator::new(fast_config(), Arc::new(clock.clone()), store.clone());
        orchestrator.start_monitoring(USER, SESSION).unwrap();

        let writers: Vec<_> = [
            InteractionKind::Message,
            InteractionKind::Typing,
            InteractionKind::Click,
            InteractionKind::Blur,
            InteractionKind::Focus,
        ]
        .into_iter()
        .map(|kind| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    assert_eq!(orchestrator.record_interaction(USER, kind, None), Ok(true));
                    orchestrator.run_cycle(USER);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

        let reader = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let record = orchestrator.get_unified_presence(USER).unwrap();
                    assert_eq!(record.user_id, USER);
                    assert_eq!(record.state == UnifiedPresenceState::Unknown, record.contributing_sources.is_empty());
                    for value in [
                        record.score,
                        record.confidence,
                        record.availability_score,
                        record.attention_level,
                        record.interruption_receptivity,
                    ] {
                        assert!((0.0..=1.0).contains(&value), "{value} out of range");
                    }
                    assert!(record.updated_at >= record.state_since);
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        reader.await.unwrap();
        orchestrator.stop_monitoring(USER).await;

        let history = store.all();
        assert!(!history.is_empty());
        assert_eq!(history[0].from_state, UnifiedPresenceState::Unknown);
        for pair in history.windows(2) {
            assert_eq!(pair[0].to_state, pair[1].from_state);
            assert!(pair[0].timestamp <= pair[1].timestamp);
            assert!(pair[0].id < pair[1].id);
        }
    }
}
