//! Presence Orchestrator.
//!
//! Owns the three leaf detectors and, per monitored user, a fused
//! [`UnifiedPresenceRecord`] kept current by a periodic fusion cycle.
//!
//! ## Per-User Workers
//!
//! ```text
//!   start_monitoring(user, session)
//!        │
//!        ├── sample     every sensor.sample_interval_secs     probes → background sensor
//!        ├── aggregate  every sensor.aggregate_interval_secs  background indicator
//!        ├── idle       every idle.reevaluate_interval_secs   idle bucket + pattern learning
//!        └── fusion     every fusion.interval_secs            unified record + transitions
//!
//!   stop_monitoring(user): mark stopping → cancel token → join all four
//!                          → stop detectors → final flush → remove entry
//! ```
//!
//! A user's entry stays in the map, marked as stopping, until teardown has
//! finished. Starting the same user in that window is rejected with
//! [`PresenceError::StopInProgress`], so a restart never shares detector
//! state with the teardown of the previous run.
//!
//! Workers hold only a weak reference to the orchestrator, so dropping it
//! without stopping users does not leak running loops.
//!
//! ## Failure Handling
//!
//! - A panicking detector query is caught and that source is left out of the
//!   cycle, lowering confidence.
//! - A transition that cannot be persisted stays in a per-user queue and is
//!   retried, in order, on the next cycle. The in-memory record stays
//!   authoritative.
//! - Store writes happen outside the record lock, serialized per user by a
//!   separate flush lock, so readers never wait on disk I/O.

use crate::db::patterns::PatternStore;
use crate::db::transitions::TransitionStore;
use crate::libs::background::{BackgroundIndicator, BackgroundSensor, SensorKind, Signal};
use crate::libs::clock::{secs_between, ClockRef};
use crate::libs::config::PresenceConfig;
use crate::libs::error::{require_id, require_metadata, PresenceError};
use crate::libs::fusion::{fuse, FusionInputs};
use crate::libs::idle::{ActivityKind, ActivityPattern, IdleMonitor};
use crate::libs::messages::Message;
use crate::libs::presence::{SourceKind, TransitionRecord, UnifiedPresenceRecord};
use crate::libs::probe::SignalProbe;
use crate::libs::session::{InteractionKind, SessionTracker};
use crate::libs::worker::PeriodicWorker;
use crate::{msg_debug, msg_error, msg_info, msg_warning};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Observer invoked once per state change.
pub type TransitionCallback = Arc<dyn Fn(&TransitionRecord) + Send + Sync>;

/// Activity an interaction implies for the idle monitor, with its intensity.
pub fn activity_for(kind: InteractionKind) -> Option<(ActivityKind, f64)> {
    match kind {
        InteractionKind::Message => Some((ActivityKind::Keyboard, 1.0)),
        InteractionKind::Typing => Some((ActivityKind::Keyboard, 0.8)),
        InteractionKind::Voice => Some((ActivityKind::Voice, 1.0)),
        InteractionKind::Click => Some((ActivityKind::Mouse, 0.6)),
        InteractionKind::Scroll => Some((ActivityKind::Mouse, 0.4)),
        InteractionKind::Focus => Some((ActivityKind::Ui, 0.5)),
        InteractionKind::Blur => None,
    }
}

/// Browser signal an interaction implies for the background sensor.
pub fn browser_signal_for(kind: InteractionKind) -> Signal {
    match kind {
        InteractionKind::Focus => Signal::Focus,
        InteractionKind::Blur => Signal::Blur,
        _ => Signal::Interaction,
    }
}

/// Runs a detector query, treating a panic as an absent source.
pub(crate) fn guarded<T>(user_id: &str, source: SourceKind, query: impl FnOnce() -> Option<T>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(query)) {
        Ok(value) => value,
        Err(_) => {
            msg_warning!(Message::SourceQueryFailed(user_id.to_string(), source.to_string()));
            None
        }
    }
}

struct UserPresence {
    record: UnifiedPresenceRecord,
    last_transition_at: DateTime<Utc>,
    pending: VecDeque<TransitionRecord>,
    stopped: bool,
}

struct UserMonitor {
    session_id: String,
    presence: Arc<Mutex<UserPresence>>,
    flushing: Arc<Mutex<()>>,
    cancel: CancellationToken,
    workers: Vec<PeriodicWorker>,
    stopping: bool,
}

struct Inner {
    config: PresenceConfig,
    clock: ClockRef,
    session: SessionTracker,
    idle: IdleMonitor,
    background: BackgroundSensor,
    store: Arc<dyn TransitionStore>,
    patterns: Option<Arc<dyn PatternStore>>,
    users: DashMap<String, UserMonitor>,
    observers: DashMap<String, Vec<TransitionCallback>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.users.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Fuses the leaf detectors into one presence record per monitored user.
#[derive(Clone)]
pub struct PresenceOrchestrator {
    inner: Arc<Inner>,
}

impl PresenceOrchestrator {
    pub fn new(config: PresenceConfig, clock: ClockRef, store: Arc<dyn TransitionStore>) -> Self {
        Self::with_probes(config, clock, store, Vec::new())
    }

    pub fn with_probes(
        config: PresenceConfig,
        clock: ClockRef,
        store: Arc<dyn TransitionStore>,
        probes: Vec<Arc<dyn SignalProbe>>,
    ) -> Self {
        Self::build(config, clock, store, probes, None)
    }

    /// Persists learned idle patterns when a user stops and restores them on
    /// the next start.
    pub fn with_pattern_store(self, patterns: Arc<dyn PatternStore>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.patterns = Some(patterns);
                Self { inner: Arc::new(inner) }
            }
            Err(inner) => {
                msg_warning!(Message::PatternStoreNotAttached);
                Self { inner }
            }
        }
    }

    fn build(
        config: PresenceConfig,
        clock: ClockRef,
        store: Arc<dyn TransitionStore>,
        probes: Vec<Arc<dyn SignalProbe>>,
        patterns: Option<Arc<dyn PatternStore>>,
    ) -> Self {
        let inner = Inner {
            session: SessionTracker::new(config.session.clone(), clock.clone()),
            idle: IdleMonitor::new(config.idle.clone(), clock.clone()),
            background: BackgroundSensor::with_probes(config.sensor.clone(), clock.clone(), probes),
            config,
            clock,
            store,
            patterns,
            users: DashMap::new(),
            observers: DashMap::new(),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    pub fn session_tracker(&self) -> &SessionTracker {
        &self.inner.session
    }

    pub fn idle_monitor(&self) -> &IdleMonitor {
        &self.inner.idle
    }

    pub fn background_sensor(&self) -> &BackgroundSensor {
        &self.inner.background
    }

    /// Starts monitoring `user_id` in `session_id`.
    ///
    /// Calling it again for a monitored user switches the session and keeps
    /// everything else running. Fails with [`PresenceError::StopInProgress`]
    /// while a stop for the same user has not returned yet. Periodic workers
    /// are only spawned when called from inside a tokio runtime; otherwise
    /// cycles must be driven with [`run_cycle`](Self::run_cycle).
    pub fn start_monitoring(&self, user_id: &str, session_id: &str) -> Result<(), PresenceError> {
        require_id(user_id, "user id")?;
        require_id(session_id, "session id")?;
        let inner = &self.inner;

        // Loaded before the entry is locked so other users in the shard do not wait on storage.
        let preloaded = (!inner.users.contains_key(user_id)).then(|| self.load_pattern(user_id));

        match inner.users.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let monitor = occupied.get_mut();
                if monitor.stopping {
                    return Err(PresenceError::StopInProgress(user_id.to_string()));
                }
                if monitor.session_id != session_id {
                    inner.session.end(&monitor.session_id);
                    inner.session.start(user_id, session_id);
                    monitor.session_id = session_id.to_string();
                    monitor.presence.lock().record.session_id = session_id.to_string();
                    msg_info!(Message::MonitoringSessionSwitched(user_id.to_string(), session_id.to_string()));
                }
                Ok(())
            }
            Entry::Vacant(vacant) => {
                let pattern = match preloaded {
                    Some(pattern) => pattern,
                    None => self.load_pattern(user_id),
                };

                inner.session.start(user_id, session_id);
                inner.idle.start(user_id);
                if let Some(pattern) = pattern {
                    inner.idle.restore_pattern(user_id, pattern);
                }
                inner.background.start(user_id);

                let now = inner.clock.now();
                let presence = Arc::new(Mutex::new(UserPresence {
                    record: UnifiedPresenceRecord::unknown(user_id, session_id, now),
                    last_transition_at: now,
                    pending: VecDeque::new(),
                    stopped: false,
                }));

                let cancel = CancellationToken::new();
                let workers = match Handle::try_current() {
                    Ok(runtime) => self.spawn_workers(&runtime, user_id, &cancel),
                    Err(_) => {
                        msg_warning!(Message::NoAsyncRuntime(user_id.to_string()));
                        Vec::new()
                    }
                };

                vacant.insert(UserMonitor {
                    session_id: session_id.to_string(),
                    presence,
                    flushing: Arc::new(Mutex::new(())),
                    cancel,
                    workers,
                    stopping: false,
                });
                msg_info!(Message::MonitoringStarted(user_id.to_string(), session_id.to_string()));
                Ok(())
            }
        }
    }

    fn load_pattern(&self, user_id: &str) -> Option<ActivityPattern> {
        let patterns = self.inner.patterns.as_ref()?;
        match patterns.load(user_id) {
            Ok(pattern) => pattern,
            Err(e) => {
                msg_warning!(Message::PatternLoadFailed(user_id.to_string(), e.to_string()));
                None
            }
        }
    }

    fn spawn_workers(&self, runtime: &Handle, user_id: &str, cancel: &CancellationToken) -> Vec<PeriodicWorker> {
        let config = &self.inner.config;
        let secs = |value: u64| std::time::Duration::from_secs(value.max(1));
        let mut workers = Vec::with_capacity(4);

        if self.inner.background.has_probes() {
            workers.push(self.worker(runtime, user_id, "sample", secs(config.sensor.sample_interval_secs), cancel, |inner, user| {
                inner.background.sample(user);
            }));
        }
        workers.push(self.worker(runtime, user_id, "aggregate", secs(config.sensor.aggregate_interval_secs), cancel, |inner, user| {
            inner.background.aggregate(user);
        }));
        workers.push(self.worker(runtime, user_id, "idle", secs(config.idle.reevaluate_interval_secs), cancel, |inner, user| {
            inner.idle.reevaluate(user);
        }));
        workers.push(self.worker(runtime, user_id, "fusion", secs(config.fusion.interval_secs), cancel, |inner, user| {
            cycle(inner, user);
        }));

        workers
    }

    fn worker(
        &self,
        runtime: &Handle,
        user_id: &str,
        name: &str,
        period: std::time::Duration,
        cancel: &CancellationToken,
        tick: fn(&Inner, &str),
    ) -> PeriodicWorker {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let user = user_id.to_string();
        PeriodicWorker::spawn(runtime, format!("{}:{}", name, user_id), period, cancel.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                tick(&inner, &user);
            }
        })
    }

    /// False once a stop has begun, even before it returns.
    pub fn is_monitoring(&self, user_id: &str) -> bool {
        self.inner.users.get(user_id).is_some_and(|monitor| !monitor.stopping)
    }

    pub fn monitored_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .users
            .iter()
            .filter(|entry| !entry.stopping)
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }

    /// Fans one interaction out to all three detectors.
    ///
    /// Input is validated before anything is touched. Returns `Ok(false)` for
    /// users that are not monitored. A session that is missing or has expired
    /// is restarted under the same id.
    pub fn record_interaction(
        &self,
        user_id: &str,
        kind: InteractionKind,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool, PresenceError> {
        require_id(user_id, "user id")?;
        require_metadata(metadata.as_ref())?;
        let inner = &self.inner;

        // Held for the whole fan-out so stop_monitoring cannot interleave.
        let Some(monitor) = inner.users.get(user_id).filter(|monitor| !monitor.stopping) else {
            msg_warning!(Message::UserNotMonitored(user_id.to_string()));
            return Ok(false);
        };

        if !inner.session.record_interaction(&monitor.session_id, kind, metadata.clone()) {
            inner.session.start(user_id, &monitor.session_id);
            inner.session.record_interaction(&monitor.session_id, kind, metadata.clone());
        }

        if let Some((activity, intensity)) = activity_for(kind) {
            inner.idle.record_activity(user_id, activity, Some(intensity))?;
        }
        inner
            .background
            .record_signal(user_id, SensorKind::Browser, browser_signal_for(kind), metadata)?;

        Ok(true)
    }

    /// Latest fused record, or `None` when the user is not monitored.
    pub fn get_unified_presence(&self, user_id: &str) -> Option<UnifiedPresenceRecord> {
        let presence = self.inner.users.get(user_id).map(|monitor| monitor.presence.clone())?;
        let guard = presence.lock();
        let record = if guard.stopped { None } else { Some(guard.record.clone()) };
        record
    }

    /// Registers an observer for a user's transitions. Observers survive
    /// stop/start cycles.
    pub fn on_transition<F>(&self, user_id: &str, callback: F) -> Result<(), PresenceError>
    where
        F: Fn(&TransitionRecord) + Send + Sync + 'static,
    {
        require_id(user_id, "user id")?;
        self.inner
            .observers
            .entry(user_id.to_string())
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    /// Runs one fusion cycle now. Returns the updated record.
    pub fn run_cycle(&self, user_id: &str) -> Option<UnifiedPresenceRecord> {
        cycle(&self.inner, user_id)
    }

    /// Transitions waiting to be persisted for a user.
    pub fn pending_transitions(&self, user_id: &str) -> usize {
        self.inner
            .users
            .get(user_id)
            .map_or(0, |monitor| monitor.presence.lock().pending.len())
    }

    pub fn history(&self, user_id: &str, limit: usize) -> Result<Vec<TransitionRecord>> {
        self.inner.store.history(user_id, limit)
    }

    /// Drops stored transitions older than the configured retention.
    pub fn prune_history(&self) -> Result<usize> {
        let days = self.inner.config.fusion.history_retention_days.max(0);
        let cutoff = self.inner.clock.now() - Duration::days(days);
        let removed = self.inner.store.prune_older_than(cutoff)?;
        msg_debug!(Message::HistoryPruned(removed));
        Ok(removed)
    }

    /// Stops every worker for the user, waits for them and tears down the
    /// detectors. Returns the final record, or `None` when the user is not
    /// monitored or another stop for it is already under way.
    ///
    /// Writes are ignored from the moment this is called. Once it returns,
    /// nothing more is written for the user until monitoring is started
    /// again.
    pub async fn stop_monitoring(&self, user_id: &str) -> Option<UnifiedPresenceRecord> {
        let inner = &self.inner;
        let (session_id, presence, flushing, workers) = {
            let mut monitor = inner.users.get_mut(user_id)?;
            if monitor.stopping {
                return None;
            }
            monitor.stopping = true;
            monitor.cancel.cancel();
            (
                monitor.session_id.clone(),
                monitor.presence.clone(),
                monitor.flushing.clone(),
                std::mem::take(&mut monitor.workers),
            )
        };

        let final_record = {
            let mut presence = presence.lock();
            presence.stopped = true;
            presence.record.clone()
        };

        for worker in workers {
            worker.join().await;
        }

        inner.session.end(&session_id);
        if let Some(pattern) = inner.idle.stop(user_id) {
            if let Some(patterns) = &inner.patterns {
                if let Err(e) = patterns.save(user_id, &pattern) {
                    msg_warning!(Message::PatternSaveFailed(user_id.to_string(), e.to_string()));
                }
            }
        }
        inner.background.stop(user_id);

        flush(inner.store.as_ref(), user_id, &presence, &flushing);
        let dropped = std::mem::take(&mut presence.lock().pending);
        if !dropped.is_empty() {
            msg_error!(Message::TransitionsDropped(user_id.to_string(), dropped.len()));
        }

        inner.users.remove_if(user_id, |_, monitor| monitor.stopping);
        msg_info!(Message::MonitoringStopped(user_id.to_string()));
        Some(final_record)
    }

    /// Stops every monitored user.
    pub async fn shutdown(&self) {
        for user_id in self.monitored_users() {
            self.stop_monitoring(&user_id).await;
        }
    }
}

/// Appends pending transitions in order, stopping at the first failure.
///
/// The record lock is only taken to peek and pop; the store write runs under
/// `flushing` alone.
fn flush(store: &dyn TransitionStore, user_id: &str, presence: &Mutex<UserPresence>, flushing: &Mutex<()>) {
    let _flushing = flushing.lock();
    loop {
        let Some(next) = presence.lock().pending.front().cloned() else {
            break;
        };
        if let Err(e) = store.append(&next) {
            msg_warning!(Message::TransitionPersistFailed(user_id.to_string(), e.to_string()));
            break;
        }
        presence.lock().pending.pop_front();
    }
}

fn gather(inner: &Inner, user_id: &str, session_id: &str) -> FusionInputs {
    let session = guarded(user_id, SourceKind::Session, || {
        if inner.session.end_if_expired(session_id).is_some() {
            return None;
        }
        inner.session.snapshot(session_id)
    });

    let idle = guarded(user_id, SourceKind::Idle, || inner.idle.status(user_id));
    let learned_break_minutes = guarded(user_id, SourceKind::Idle, || {
        inner.idle.pattern(user_id).and_then(|pattern| pattern.preferred_break_minutes)
    });

    let stale_after = inner.config.fusion.background_stale_secs as f64;
    let now = inner.clock.now();
    let background = guarded(user_id, SourceKind::Background, || {
        inner
            .background
            .indicator(user_id)
            .filter(|indicator: &BackgroundIndicator| {
                indicator
                    .last_reading_at
                    .is_some_and(|at| secs_between(at, now) <= stale_after)
            })
    });

    FusionInputs {
        session,
        idle,
        background,
        learned_break_minutes,
    }
}

fn cycle(inner: &Inner, user_id: &str) -> Option<UnifiedPresenceRecord> {
    let (presence, flushing, session_id) = {
        let monitor = inner.users.get(user_id).filter(|monitor| !monitor.stopping)?;
        (monitor.presence.clone(), monitor.flushing.clone(), monitor.session_id.clone())
    };

    let (record, transition) = {
        let mut presence = presence.lock();
        if presence.stopped {
            return None;
        }

        let inputs = gather(inner, user_id, &session_id);
        let outcome = fuse(&inputs, &inner.config.fusion);
        let now = inner.clock.now().max(presence.last_transition_at);

        let previous = presence.record.state;
        let transition = if outcome.state != previous {
            let transition = TransitionRecord {
                id: None,
                user_id: user_id.to_string(),
                from_state: previous,
                to_state: outcome.state,
                context: outcome.context,
                confidence: outcome.confidence,
                availability: outcome.availability,
                attention: outcome.attention,
                receptivity: outcome.receptivity,
                duration_secs: secs_between(presence.record.state_since, now),
                contributing_sources: outcome.sources.clone(),
                metadata: json!({
                    "session_id": session_id,
                    "score": outcome.score,
                    "predicted_return_minutes": outcome.predicted_return_minutes,
                }),
                timestamp: now,
            };
            msg_debug!(Message::PresenceTransition(
                user_id.to_string(),
                previous.to_string(),
                outcome.state.to_string()
            ));
            presence.record.state_since = now;
            presence.last_transition_at = now;
            presence.pending.push_back(transition.clone());
            Some(transition)
        } else {
            None
        };

        let state_since = presence.record.state_since;
        let record = &mut presence.record;
        record.session_id = session_id;
        record.state = outcome.state;
        record.context = outcome.context;
        record.score = outcome.score;
        record.confidence = outcome.confidence;
        record.availability_score = outcome.availability;
        record.attention_level = outcome.attention;
        record.interruption_receptivity = outcome.receptivity;
        record.predicted_return_minutes = outcome.predicted_return_minutes;
        record.duration_in_state_secs = secs_between(state_since, now);
        record.contributing_sources = outcome.sources;
        record.updated_at = now;
        let record = record.clone();
        (record, transition)
    };

    flush(inner.store.as_ref(), user_id, &presence, &flushing);

    if let Some(transition) = transition {
        notify(inner, &transition);
    }
    Some(record)
}

fn notify(inner: &Inner, transition: &TransitionRecord) {
    let observers: Vec<TransitionCallback> = inner
        .observers
        .get(&transition.user_id)
        .map(|observers| observers.value().clone())
        .unwrap_or_default();

    for observer in observers {
        if panic::catch_unwind(AssertUnwindSafe(|| observer(transition))).is_err() {
            msg_warning!(Message::ObserverPanicked(transition.user_id.clone()));
        }
    }
}
