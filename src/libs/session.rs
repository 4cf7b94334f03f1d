//! Session Interaction Tracker.
//!
//! Consumes explicit interaction events (messages, voice, typing, clicks,
//! scrolls, focus/blur) for individual sessions and derives a categorical
//! presence state together with an engagement level.
//!
//! ## State Model
//!
//! ```text
//!  interaction          60s silence         300s silence        1800s silence
//! ───────────▶ ACTIVE ──────────────▶ IDLE ──────────────▶ AWAY ─────────────▶ (ended)
//!                ▲  ▲                   │                    │
//!                │  └───── any interaction ──────────────────┘
//!                │
//!           focus/any ─── BACKGROUND ◀── blur (from any state)
//! ```
//!
//! Thresholds are measured from the most recent interaction and come from
//! [`SessionConfig`].
//!
//! ## Engagement
//!
//! The interaction rate (per minute, over a rolling window) is tiered into
//! HIGH / MODERATE / LOW / MINIMAL and downgraded one tier when the session
//! spent less than half of its lifetime in focus.

use crate::libs::clock::{secs_between, ClockRef};
use crate::libs::config::SessionConfig;
use crate::libs::error::PresenceError;
use crate::libs::messages::Message;
use crate::{msg_debug, msg_info, msg_warning};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Kind of explicit interaction reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Message,
    Voice,
    Typing,
    Click,
    Scroll,
    Focus,
    Blur,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 7] = [
        InteractionKind::Message,
        InteractionKind::Voice,
        InteractionKind::Typing,
        InteractionKind::Click,
        InteractionKind::Scroll,
        InteractionKind::Focus,
        InteractionKind::Blur,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Message => "message",
            InteractionKind::Voice => "voice",
            InteractionKind::Typing => "typing",
            InteractionKind::Click => "click",
            InteractionKind::Scroll => "scroll",
            InteractionKind::Focus => "focus",
            InteractionKind::Blur => "blur",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionKind {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        InteractionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| PresenceError::UnknownInteractionKind(s.to_string()))
    }
}

/// Categorical presence state of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Active,
    Idle,
    Away,
    Background,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Active => "ACTIVE",
            SessionState::Idle => "IDLE",
            SessionState::Away => "AWAY",
            SessionState::Background => "BACKGROUND",
        };
        f.write_str(label)
    }
}

/// Engagement tiers, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementLevel {
    Minimal,
    Low,
    Moderate,
    High,
}

impl EngagementLevel {
    /// One tier lower; MINIMAL stays MINIMAL.
    pub fn downgrade(self) -> Self {
        match self {
            EngagementLevel::High => EngagementLevel::Moderate,
            EngagementLevel::Moderate => EngagementLevel::Low,
            EngagementLevel::Low | EngagementLevel::Minimal => EngagementLevel::Minimal,
        }
    }
}

impl fmt::Display for EngagementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngagementLevel::High => "HIGH",
            EngagementLevel::Moderate => "MODERATE",
            EngagementLevel::Low => "LOW",
            EngagementLevel::Minimal => "MINIMAL",
        };
        f.write_str(label)
    }
}

/// One explicit interaction. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: String,
    pub session_id: String,
    pub kind: InteractionKind,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Point-in-time summary of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub state: SessionState,
    pub engagement_level: EngagementLevel,
    /// Interactions per minute over the rolling window.
    pub interaction_rate: f64,
    /// Share of the session lifetime spent in focus, 0-100.
    pub focus_percentage: f64,
    pub last_interaction_age_secs: f64,
    /// Interactions currently held in the window buffer.
    pub interaction_count: usize,
    pub started_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
}

/// Returned when a session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_interactions: usize,
    pub interactions_by_kind: BTreeMap<InteractionKind, usize>,
    pub focus_percentage: f64,
    pub final_engagement: EngagementLevel,
}

/// Classifies a session from the age of its last interaction.
///
/// Returns `None` once the session has been silent long enough to end.
pub fn classify_session(last_interaction_age_secs: f64, blurred: bool, config: &SessionConfig) -> Option<SessionState> {
    if last_interaction_age_secs >= config.end_after_secs as f64 {
        return None;
    }
    if blurred {
        return Some(SessionState::Background);
    }
    let state = if last_interaction_age_secs < config.idle_after_secs as f64 {
        SessionState::Active
    } else if last_interaction_age_secs < config.away_after_secs as f64 {
        SessionState::Idle
    } else {
        SessionState::Away
    };
    Some(state)
}

/// Tiers an interaction rate and applies the low-focus downgrade.
pub fn engagement_for(rate_per_minute: f64, focus_percentage: f64, config: &SessionConfig) -> EngagementLevel {
    let level = if rate_per_minute >= config.high_rate {
        EngagementLevel::High
    } else if rate_per_minute >= config.moderate_rate {
        EngagementLevel::Moderate
    } else if rate_per_minute >= config.low_rate {
        EngagementLevel::Low
    } else {
        EngagementLevel::Minimal
    };

    if focus_percentage < config.min_focus_percentage {
        level.downgrade()
    } else {
        level
    }
}

#[derive(Debug)]
struct SessionRecord {
    user_id: String,
    started_at: DateTime<Utc>,
    last_interaction: DateTime<Utc>,
    events: VecDeque<InteractionEvent>,
    blurred_since: Option<DateTime<Utc>>,
    background_secs: f64,
    totals: BTreeMap<InteractionKind, usize>,
}

impl SessionRecord {
    fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            started_at: now,
            last_interaction: now,
            events: VecDeque::new(),
            blurred_since: None,
            background_secs: 0.0,
            totals: BTreeMap::new(),
        }
    }

    fn last_age(&self, now: DateTime<Utc>) -> f64 {
        secs_between(self.last_interaction, now)
    }

    fn state_at(&self, now: DateTime<Utc>, config: &SessionConfig) -> Option<SessionState> {
        classify_session(self.last_age(now), self.blurred_since.is_some(), config)
    }

    fn focus_percentage(&self, now: DateTime<Utc>) -> f64 {
        let lifetime = secs_between(self.started_at, now);
        if lifetime <= 0.0 {
            return 100.0;
        }
        let background = self.background_secs + self.blurred_since.map_or(0.0, |since| secs_between(since, now));
        (((lifetime - background) / lifetime) * 100.0).clamp(0.0, 100.0)
    }

    fn interaction_rate(&self, now: DateTime<Utc>, config: &SessionConfig) -> f64 {
        let window = config.rate_window_secs as f64;
        let cutoff = now - Duration::seconds(config.rate_window_secs as i64);
        let count = self
            .events
            .iter()
            .filter(|event| event.kind != InteractionKind::Blur && event.timestamp > cutoff)
            .count();
        let span_minutes = (window.min(secs_between(self.started_at, now)) / 60.0).max(1.0);
        count as f64 / span_minutes
    }

    fn apply(&mut self, event: InteractionEvent, config: &SessionConfig) {
        let now = event.timestamp;
        match event.kind {
            InteractionKind::Blur => {
                if self.blurred_since.is_none() {
                    self.blurred_since = Some(now);
                }
            }
            _ => {
                if let Some(since) = self.blurred_since.take() {
                    self.background_secs += secs_between(since, now);
                }
            }
        }

        *self.totals.entry(event.kind).or_insert(0) += 1;
        if now > self.last_interaction {
            self.last_interaction = now;
        }
        self.events.push_back(event);
        self.prune(now, config);
    }

    fn prune(&mut self, now: DateTime<Utc>, config: &SessionConfig) {
        let cutoff = now - Duration::seconds(config.retention_secs as i64);
        while self.events.front().is_some_and(|event| event.timestamp < cutoff) {
            self.events.pop_front();
        }
        while self.events.len() > config.max_events {
            self.events.pop_front();
        }
    }

    fn snapshot(&self, session_id: &str, now: DateTime<Utc>, config: &SessionConfig) -> Option<SessionSnapshot> {
        let state = self.state_at(now, config)?;
        let interaction_rate = self.interaction_rate(now, config);
        let focus_percentage = self.focus_percentage(now);
        Some(SessionSnapshot {
            session_id: session_id.to_string(),
            user_id: self.user_id.clone(),
            state,
            engagement_level: engagement_for(interaction_rate, focus_percentage, config),
            interaction_rate,
            focus_percentage,
            last_interaction_age_secs: self.last_age(now),
            interaction_count: self.events.len(),
            started_at: self.started_at,
            taken_at: now,
        })
    }

    fn summary(&self, session_id: &str, now: DateTime<Utc>, config: &SessionConfig) -> SessionSummary {
        let focus_percentage = self.focus_percentage(now);
        SessionSummary {
            session_id: session_id.to_string(),
            user_id: self.user_id.clone(),
            started_at: self.started_at,
            ended_at: now,
            duration_secs: secs_between(self.started_at, now),
            total_interactions: self.totals.values().sum(),
            interactions_by_kind: self.totals.clone(),
            focus_percentage,
            final_engagement: engagement_for(self.interaction_rate(now, config), focus_percentage, config),
        }
    }
}

/// Tracks interaction cadence for any number of concurrent sessions.
///
/// Sessions live in a sharded map, so recording into one session never
/// contends with snapshots of another.
pub struct SessionTracker {
    config: SessionConfig,
    clock: ClockRef,
    sessions: DashMap<String, SessionRecord>,
}

impl SessionTracker {
    pub fn new(config: SessionConfig, clock: ClockRef) -> Self {
        Self {
            config,
            clock,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts (or restarts) tracking of `session_id` for `user_id`.
    pub fn start(&self, user_id: &str, session_id: &str) {
        let now = self.clock.now();
        self.sessions.insert(session_id.to_string(), SessionRecord::new(user_id, now));
        msg_info!(Message::SessionStarted(session_id.to_string(), user_id.to_string()));
    }

    pub fn is_tracking(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Appends an interaction to a session.
    ///
    /// Returns `false` without touching any state when the session is unknown
    /// or has already run past its end threshold (in which case it is ended).
    pub fn record_interaction(&self, session_id: &str, kind: InteractionKind, metadata: Option<serde_json::Value>) -> bool {
        let now = self.clock.now();

        let expired = {
            let Some(mut record) = self.sessions.get_mut(session_id) else {
                msg_warning!(Message::SessionNotFound(session_id.to_string()));
                return false;
            };

            if record.state_at(now, &self.config).is_none() {
                true
            } else {
                let event = InteractionEvent {
                    user_id: record.user_id.clone(),
                    session_id: session_id.to_string(),
                    kind,
                    timestamp: now,
                    metadata,
                };
                record.apply(event, &self.config);
                msg_debug!(Message::InteractionRecorded(session_id.to_string(), kind.to_string()));
                false
            }
        };

        if expired {
            msg_info!(Message::SessionExpired(session_id.to_string()));
            self.end(session_id);
            return false;
        }
        true
    }

    /// Current snapshot, or `None` for unknown or ended sessions.
    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let now = self.clock.now();
        self.sessions
            .get(session_id)
            .and_then(|record| record.snapshot(session_id, now, &self.config))
    }

    /// Ends the session if it has been silent past the end threshold.
    pub fn end_if_expired(&self, session_id: &str) -> Option<SessionSummary> {
        let now = self.clock.now();
        let expired = self
            .sessions
            .get(session_id)
            .is_some_and(|record| record.state_at(now, &self.config).is_none());
        if !expired {
            return None;
        }
        msg_info!(Message::SessionExpired(session_id.to_string()));
        self.end(session_id)
    }

    /// Stops tracking a session and returns its summary.
    pub fn end(&self, session_id: &str) -> Option<SessionSummary> {
        let now = self.clock.now();
        let (_, record) = self.sessions.remove(session_id)?;
        let summary = record.summary(session_id, now, &self.config);
        msg_info!(Message::SessionEnded(
            session_id.to_string(),
            summary.total_interactions,
            summary.duration_secs.round() as u64
        ));
        Some(summary)
    }

    /// Ends every session that has run past its end threshold.
    pub fn sweep_expired(&self) -> Vec<SessionSummary> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state_at(now, &self.config).is_none())
            .map(|entry| entry.key().clone())
            .collect();
        expired.iter().filter_map(|session_id| self.end(session_id)).collect()
    }

    /// Session ids currently tracked for a user.
    pub fn sessions_for(&self, user_id: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_session_thresholds() {
        let config = SessionConfig::default();
        assert_eq!(classify_session(0.0, false, &config), Some(SessionState::Active));
        assert_eq!(classify_session(59.9, false, &config), Some(SessionState::Active));
        assert_eq!(classify_session(60.0, false, &config), Some(SessionState::Idle));
        assert_eq!(classify_session(299.0, false, &config), Some(SessionState::Idle));
        assert_eq!(classify_session(300.0, false, &config), Some(SessionState::Away));
        assert_eq!(classify_session(1799.0, false, &config), Some(SessionState::Away));
        assert_eq!(classify_session(1800.0, false, &config), None);
    }

    #[test]
    fn test_blur_wins_over_elapsed_time() {
        let config = SessionConfig::default();
        assert_eq!(classify_session(5.0, true, &config), Some(SessionState::Background));
        assert_eq!(classify_session(600.0, true, &config), Some(SessionState::Background));
    }

    #[test]
    fn test_engagement_tiers_and_focus_downgrade() {
        let config = SessionConfig::default();
        assert_eq!(engagement_for(2.5, 100.0, &config), EngagementLevel::High);
        assert_eq!(engagement_for(0.5, 100.0, &config), EngagementLevel::Moderate);
        assert_eq!(engagement_for(0.1, 100.0, &config), EngagementLevel::Low);
        assert_eq!(engagement_for(0.05, 100.0, &config), EngagementLevel::Minimal);
        assert_eq!(engagement_for(2.5, 40.0, &config), EngagementLevel::Moderate);
        assert_eq!(engagement_for(0.05, 10.0, &config), EngagementLevel::Minimal);
    }

    #[test]
    fn test_interaction_kind_parsing() {
        assert_eq!("Message".parse::<InteractionKind>(), Ok(InteractionKind::Message));
        assert_eq!(" blur ".parse::<InteractionKind>(), Ok(InteractionKind::Blur));
        assert!(matches!(
            "wave".parse::<InteractionKind>(),
            Err(PresenceError::UnknownInteractionKind(_))
        ));
    }
}
