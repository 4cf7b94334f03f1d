//! Idle/Activity Monitor.
//!
//! Consumes raw activity events (keyboard, mouse, voice, UI, navigation,
//! content) per user, classifies the time since the last activity into an
//! idle bucket and learns how long the user typically works and rests.
//!
//! ## Idle Buckets
//!
//! | Seconds since last activity | Bucket        |
//! |-----------------------------|---------------|
//! | < 60                        | `ACTIVE`      |
//! | < 300                       | `SHORT_IDLE`  |
//! | < 900                       | `MEDIUM_IDLE` |
//! | < 1800                      | `LONG_IDLE`   |
//! | >= 1800                     | `DEEP_IDLE`   |
//!
//! ## Pattern Learning
//!
//! The periodic re-evaluation notices when a user comes back: the first
//! activity after a non-ACTIVE stretch is a return from idle if the monitor
//! observes it within `return_window_secs`. The silent stretch becomes a break
//! observation, and when that break was long enough to split sessions, the
//! active stretch before it becomes a session-length observation. Both feed
//! running means whose accumulated weight decays by `pattern_decay_per_week`
//! for every week the pattern goes without updates.

use crate::libs::clock::{secs_between, ClockRef};
use crate::libs::config::IdleConfig;
use crate::libs::error::{require_unit, PresenceError};
use crate::libs::messages::Message;
use crate::{msg_debug, msg_info, msg_warning};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

const SECS_PER_WEEK: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Keyboard,
    Mouse,
    Voice,
    Ui,
    Navigation,
    Content,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 6] = [
        ActivityKind::Keyboard,
        ActivityKind::Mouse,
        ActivityKind::Voice,
        ActivityKind::Ui,
        ActivityKind::Navigation,
        ActivityKind::Content,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Keyboard => "keyboard",
            ActivityKind::Mouse => "mouse",
            ActivityKind::Voice => "voice",
            ActivityKind::Ui => "ui",
            ActivityKind::Navigation => "navigation",
            ActivityKind::Content => "content",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ActivityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| PresenceError::UnknownActivityKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleBucket {
    Active,
    ShortIdle,
    MediumIdle,
    LongIdle,
    DeepIdle,
}

impl fmt::Display for IdleBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IdleBucket::Active => "ACTIVE",
            IdleBucket::ShortIdle => "SHORT_IDLE",
            IdleBucket::MediumIdle => "MEDIUM_IDLE",
            IdleBucket::LongIdle => "LONG_IDLE",
            IdleBucket::DeepIdle => "DEEP_IDLE",
        };
        f.write_str(label)
    }
}

/// Maps seconds since the last activity to a bucket. Pure and monotonic.
pub fn classify_idle(idle_secs: f64, config: &IdleConfig) -> IdleBucket {
    if idle_secs < config.short_idle_after_secs as f64 {
        IdleBucket::Active
    } else if idle_secs < config.medium_idle_after_secs as f64 {
        IdleBucket::ShortIdle
    } else if idle_secs < config.long_idle_after_secs as f64 {
        IdleBucket::MediumIdle
    } else if idle_secs < config.deep_idle_after_secs as f64 {
        IdleBucket::LongIdle
    } else {
        IdleBucket::DeepIdle
    }
}

/// One raw activity event. Retained for `retention_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub user_id: String,
    pub kind: ActivityKind,
    pub timestamp: DateTime<Utc>,
    pub intensity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleStatus {
    pub user_id: String,
    pub bucket: IdleBucket,
    pub idle_seconds: f64,
    pub recent_activity_counts: BTreeMap<ActivityKind, usize>,
    pub last_activity: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
}

/// Learned per-user rhythm of work and rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPattern {
    pub typical_session_minutes: Option<f64>,
    pub session_weight: f64,
    pub preferred_break_minutes: Option<f64>,
    pub break_weight: f64,
    pub observations: u32,
    pub updated_at: DateTime<Utc>,
}

impl ActivityPattern {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            typical_session_minutes: None,
            session_weight: 0.0,
            preferred_break_minutes: None,
            break_weight: 0.0,
            observations: 0,
            updated_at: now,
        }
    }

    /// Folds a new observation into the decayed running means.
    pub fn observe(&mut self, session_minutes: Option<f64>, break_minutes: f64, now: DateTime<Utc>, decay_per_week: f64) {
        let retained = decay_factor(secs_between(self.updated_at, now), decay_per_week);

        if let Some(minutes) = session_minutes {
            let weight = self.session_weight * retained;
            let mean = self.typical_session_minutes.unwrap_or(minutes);
            self.typical_session_minutes = Some((mean * weight + minutes) / (weight + 1.0));
            self.session_weight = weight + 1.0;
        } else {
            self.session_weight *= retained;
        }

        let weight = self.break_weight * retained;
        let mean = self.preferred_break_minutes.unwrap_or(break_minutes);
        self.preferred_break_minutes = Some((mean * weight + break_minutes) / (weight + 1.0));
        self.break_weight = weight + 1.0;

        self.observations += 1;
        self.updated_at = now;
    }
}

/// Share of weight retained after `age_secs` at the given weekly decay rate.
pub fn decay_factor(age_secs: f64, decay_per_week: f64) -> f64 {
    (1.0 - decay_per_week.clamp(0.0, 1.0)).powf(age_secs / SECS_PER_WEEK)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakPrediction {
    pub eta_minutes: f64,
    pub probability: f64,
    pub session_elapsed_minutes: f64,
    pub typical_session_minutes: f64,
    pub expected_break_minutes: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct PendingReturn {
    break_started_at: DateTime<Utc>,
    returned_at: DateTime<Utc>,
}

#[derive(Debug)]
struct UserActivity {
    started_at: DateTime<Utc>,
    events: VecDeque<ActivityEvent>,
    last_activity: DateTime<Utc>,
    evaluated_bucket: IdleBucket,
    pending_return: Option<PendingReturn>,
    pattern: Option<ActivityPattern>,
}

impl UserActivity {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            events: VecDeque::new(),
            last_activity: now,
            evaluated_bucket: IdleBucket::Active,
            pending_return: None,
            pattern: None,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, config: &IdleConfig) {
        let cutoff = now - Duration::seconds(config.retention_secs as i64);
        while self.events.front().is_some_and(|event| event.timestamp < cutoff) {
            self.events.pop_front();
        }
        while self.events.len() > config.max_events {
            self.events.pop_front();
        }
    }

    /// Start of the session containing `at`: the activity right after the most
    /// recent gap longer than `session_gap_secs`, or the oldest retained one.
    fn session_start(&self, at: DateTime<Utc>, config: &IdleConfig) -> DateTime<Utc> {
        let gap = config.session_gap_secs as f64;
        let mut newer: Option<DateTime<Utc>> = None;
        for event in self.events.iter().rev().filter(|event| event.timestamp <= at) {
            if let Some(next) = newer {
                if secs_between(event.timestamp, next) > gap {
                    return next;
                }
            }
            newer = Some(event.timestamp);
        }
        newer.unwrap_or(self.started_at)
    }

    fn status(&self, user_id: &str, now: DateTime<Utc>, config: &IdleConfig) -> IdleStatus {
        let idle_seconds = secs_between(self.last_activity, now);
        let cutoff = now - Duration::seconds(config.recent_window_secs as i64);
        let mut recent_activity_counts = BTreeMap::new();
        for event in self.events.iter().filter(|event| event.timestamp > cutoff) {
            *recent_activity_counts.entry(event.kind).or_insert(0) += 1;
        }
        IdleStatus {
            user_id: user_id.to_string(),
            bucket: classify_idle(idle_seconds, config),
            idle_seconds,
            recent_activity_counts,
            last_activity: self.last_activity,
            taken_at: now,
        }
    }
}

/// Per-user idle classification and break-pattern learning.
pub struct IdleMonitor {
    config: IdleConfig,
    clock: ClockRef,
    users: DashMap<String, UserActivity>,
}

impl IdleMonitor {
    pub fn new(config: IdleConfig, clock: ClockRef) -> Self {
        Self {
            config,
            clock,
            users: DashMap::new(),
        }
    }

    pub fn config(&self) -> &IdleConfig {
        &self.config
    }

    /// Begins monitoring a user. Starting counts as activity.
    pub fn start(&self, user_id: &str) {
        let now = self.clock.now();
        self.users.insert(user_id.to_string(), UserActivity::new(now));
        msg_info!(Message::IdleMonitorStarted(user_id.to_string()));
    }

    pub fn is_monitoring(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Records one activity event. Intensity defaults to 1.0.
    ///
    /// Returns `Ok(false)` when the user is not monitored.
    pub fn record_activity(&self, user_id: &str, kind: ActivityKind, intensity: Option<f64>) -> Result<bool, PresenceError> {
        let intensity = require_unit(intensity.unwrap_or(1.0), PresenceError::InvalidIntensity)?;
        let now = self.clock.now();

        let Some(mut user) = self.users.get_mut(user_id) else {
            msg_warning!(Message::IdleUserNotMonitored(user_id.to_string()));
            return Ok(false);
        };

        let gap = secs_between(user.last_activity, now);
        if gap >= self.config.short_idle_after_secs as f64 {
            user.pending_return = Some(PendingReturn {
                break_started_at: user.last_activity,
                returned_at: now,
            });
        }
        if now > user.last_activity {
            user.last_activity = now;
        }
        user.events.push_back(ActivityEvent {
            user_id: user_id.to_string(),
            kind,
            timestamp: now,
            intensity,
        });
        user.prune(now, &self.config);
        Ok(true)
    }

    pub fn status(&self, user_id: &str) -> Option<IdleStatus> {
        let now = self.clock.now();
        self.users.get(user_id).map(|user| user.status(user_id, now, &self.config))
    }

    /// One periodic re-evaluation: refreshes the evaluated bucket, learns from
    /// a fresh return and prunes old events. Returns the current bucket.
    pub fn reevaluate(&self, user_id: &str) -> Option<IdleBucket> {
        let now = self.clock.now();
        let mut user = self.users.get_mut(user_id)?;

        let live = classify_idle(secs_between(user.last_activity, now), &self.config);
        if live != user.evaluated_bucket {
            msg_debug!(Message::IdleBucketChanged(user_id.to_string(), user.evaluated_bucket.to_string(), live.to_string()));
        }

        if live == IdleBucket::Active {
            if let Some(pending) = user.pending_return.take() {
                let observed_after = secs_between(pending.returned_at, now);
                if observed_after <= self.config.return_window_secs as f64 {
                    self.learn(user_id, &mut user, pending, now);
                }
            }
        }

        user.evaluated_bucket = live;
        user.prune(now, &self.config);
        Some(live)
    }

    fn learn(&self, user_id: &str, user: &mut UserActivity, pending: PendingReturn, now: DateTime<Utc>) {
        let break_secs = secs_between(pending.break_started_at, pending.returned_at);
        let session_minutes = if break_secs > self.config.session_gap_secs as f64 {
            let session_start = user.session_start(pending.break_started_at, &self.config);
            let minutes = secs_between(session_start, pending.break_started_at) / 60.0;
            (minutes > 0.0).then_some(minutes)
        } else {
            None
        };

        let pattern = user.pattern.get_or_insert_with(|| ActivityPattern::empty(now));
        pattern.observe(session_minutes, break_secs / 60.0, now, self.config.pattern_decay_per_week);
        msg_info!(Message::ReturnedFromIdle(user_id.to_string(), (break_secs / 60.0).round() as u64));
    }

    /// Predicts the next break from the learned typical session length.
    ///
    /// Returns `None` until a session length has been learned. Fusion reads
    /// `preferred_break_minutes` from [`pattern`](Self::pattern) directly,
    /// since a break length can be learned before any session length is.
    pub fn predict_next_break(&self, user_id: &str) -> Option<BreakPrediction> {
        let now = self.clock.now();
        let user = self.users.get(user_id)?;
        let pattern = user.pattern.as_ref()?;
        let typical = pattern.typical_session_minutes.filter(|minutes| *minutes > 0.0)?;

        let session_start = user.session_start(now, &self.config);
        let elapsed = secs_between(session_start, now) / 60.0;

        Some(BreakPrediction {
            eta_minutes: (typical - elapsed).max(0.0),
            probability: (elapsed / typical).min(1.0),
            session_elapsed_minutes: elapsed,
            typical_session_minutes: typical,
            expected_break_minutes: pattern.preferred_break_minutes,
        })
    }

    pub fn pattern(&self, user_id: &str) -> Option<ActivityPattern> {
        self.users.get(user_id).and_then(|user| user.pattern.clone())
    }

    /// Seeds a monitored user with a previously learned pattern.
    pub fn restore_pattern(&self, user_id: &str, pattern: ActivityPattern) -> bool {
        match self.users.get_mut(user_id) {
            Some(mut user) => {
                user.pattern = Some(pattern);
                true
            }
            None => false,
        }
    }

    /// Stops monitoring and hands back whatever pattern was learned.
    pub fn stop(&self, user_id: &str) -> Option<ActivityPattern> {
        let (_, user) = self.users.remove(user_id)?;
        msg_info!(Message::IdleMonitorStopped(user_id.to_string()));
        user.pattern
    }
}
