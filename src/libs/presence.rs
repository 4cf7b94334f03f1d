//! Unified presence types shared by fusion, the orchestrator and storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Seven-level fused presence state, most present first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnifiedPresenceState {
    HighlyEngaged,
    ActivelyPresent,
    PassivelyPresent,
    BrieflyAway,
    Away,
    DeeplyAway,
    Unknown,
}

impl UnifiedPresenceState {
    pub const ALL: [UnifiedPresenceState; 7] = [
        UnifiedPresenceState::HighlyEngaged,
        UnifiedPresenceState::ActivelyPresent,
        UnifiedPresenceState::PassivelyPresent,
        UnifiedPresenceState::BrieflyAway,
        UnifiedPresenceState::Away,
        UnifiedPresenceState::DeeplyAway,
        UnifiedPresenceState::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnifiedPresenceState::HighlyEngaged => "HIGHLY_ENGAGED",
            UnifiedPresenceState::ActivelyPresent => "ACTIVELY_PRESENT",
            UnifiedPresenceState::PassivelyPresent => "PASSIVELY_PRESENT",
            UnifiedPresenceState::BrieflyAway => "BRIEFLY_AWAY",
            UnifiedPresenceState::Away => "AWAY",
            UnifiedPresenceState::DeeplyAway => "DEEPLY_AWAY",
            UnifiedPresenceState::Unknown => "UNKNOWN",
        }
    }

    /// BRIEFLY_AWAY, AWAY and DEEPLY_AWAY.
    pub fn is_away(&self) -> bool {
        matches!(
            self,
            UnifiedPresenceState::BrieflyAway | UnifiedPresenceState::Away | UnifiedPresenceState::DeeplyAway
        )
    }
}

impl fmt::Display for UnifiedPresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnifiedPresenceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnifiedPresenceState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown presence state '{}'", s))
    }
}

/// How a present user is engaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceContext {
    FocusedSession,
    BackgroundMode,
    BreakTime,
    Multitasking,
    CasualBrowsing,
    Unknown,
}

impl PresenceContext {
    pub const ALL: [PresenceContext; 6] = [
        PresenceContext::FocusedSession,
        PresenceContext::BackgroundMode,
        PresenceContext::BreakTime,
        PresenceContext::Multitasking,
        PresenceContext::CasualBrowsing,
        PresenceContext::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceContext::FocusedSession => "FOCUSED_SESSION",
            PresenceContext::BackgroundMode => "BACKGROUND_MODE",
            PresenceContext::BreakTime => "BREAK_TIME",
            PresenceContext::Multitasking => "MULTITASKING",
            PresenceContext::CasualBrowsing => "CASUAL_BROWSING",
            PresenceContext::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PresenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PresenceContext::ALL
            .into_iter()
            .find(|context| context.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown presence context '{}'", s))
    }
}

/// The three leaf detectors feeding fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Session,
    Idle,
    Background,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Session => "session",
            SourceKind::Idle => "idle",
            SourceKind::Background => "background",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "session" => Ok(SourceKind::Session),
            "idle" => Ok(SourceKind::Idle),
            "background" => Ok(SourceKind::Background),
            other => Err(format!("unknown presence source '{}'", other)),
        }
    }
}

/// Fused presence of one monitored user. Owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedPresenceRecord {
    pub user_id: String,
    pub session_id: String,
    pub state: UnifiedPresenceState,
    pub context: PresenceContext,
    pub score: f64,
    pub confidence: f64,
    pub availability_score: f64,
    pub attention_level: f64,
    pub interruption_receptivity: f64,
    pub predicted_return_minutes: Option<f64>,
    pub state_since: DateTime<Utc>,
    pub duration_in_state_secs: f64,
    pub contributing_sources: Vec<SourceKind>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedPresenceRecord {
    /// The record a user starts with before the first fusion cycle.
    pub fn unknown(user_id: &str, session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            state: UnifiedPresenceState::Unknown,
            context: PresenceContext::Unknown,
            score: 0.0,
            confidence: 0.0,
            availability_score: 0.0,
            attention_level: 0.0,
            interruption_receptivity: 0.0,
            predicted_return_minutes: None,
            state_since: now,
            duration_in_state_secs: 0.0,
            contributing_sources: Vec::new(),
            updated_at: now,
        }
    }
}

/// Append-only log entry written on every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Assigned by the store; `None` until persisted.
    pub id: Option<i64>,
    pub user_id: String,
    pub from_state: UnifiedPresenceState,
    pub to_state: UnifiedPresenceState,
    pub context: PresenceContext,
    pub confidence: f64,
    pub availability: f64,
    pub attention: f64,
    pub receptivity: f64,
    /// Seconds spent in `from_state`.
    pub duration_secs: f64,
    pub contributing_sources: Vec<SourceKind>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub fn sources_to_string(sources: &[SourceKind]) -> String {
    sources.iter().map(SourceKind::as_str).collect::<Vec<_>>().join(",")
}

pub fn sources_from_string(value: &str) -> Vec<SourceKind> {
    value.split(',').filter_map(|part| part.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_round_trip() {
        for state in UnifiedPresenceState::ALL {
            assert_eq!(state.as_str().parse::<UnifiedPresenceState>(), Ok(state));
        }
        assert!("SLEEPING".parse::<UnifiedPresenceState>().is_err());
    }

    #[test]
    fn test_sources_string() {
        let sources = vec![SourceKind::Session, SourceKind::Background];
        assert_eq!(sources_to_string(&sources), "session,background");
        assert_eq!(sources_from_string("session,background"), sources);
        assert!(sources_from_string("").is_empty());
    }
}
