//! Presence fusion.
//!
//! A pure function from the latest detector snapshots to one fused estimate.
//! The orchestrator owns everything stateful around it (previous state,
//! duration in state, transitions); given the same inputs and configuration
//! [`fuse`] always returns the same outcome.
//!
//! ## Lookup Tables
//!
//! | Source     | Categorical output                                     | Value               |
//! |------------|--------------------------------------------------------|---------------------|
//! | session    | ACTIVE / IDLE / BACKGROUND / AWAY                      | 0.9 / 0.5 / 0.4 / 0.15 |
//! |            | × engagement HIGH / MODERATE / LOW / MINIMAL           | 1.0 / 0.85 / 0.7 / 0.55 |
//! | idle       | ACTIVE / SHORT / MEDIUM / LONG / DEEP                  | 0.95 / 0.6 / 0.3 / 0.15 / 0.05 |
//! | background | STRONG / LIKELY_PRESENT / UNCERTAIN / LIKELY_AWAY / ABSENCE | 0.9 / 0.7 / 0.5 / 0.25 / 0.05 |
//!
//! `score = Σ wᵢ·vᵢ / Σ wᵢ` over the sources present and
//! `confidence = Σ wᵢ(present) / Σ wᵢ(all)`.

use crate::libs::background::{BackgroundIndicator, PresenceLevel};
use crate::libs::config::FusionConfig;
use crate::libs::idle::{IdleBucket, IdleStatus};
use crate::libs::presence::{PresenceContext, SourceKind, UnifiedPresenceState};
use crate::libs::session::{EngagementLevel, SessionSnapshot, SessionState};
use serde::{Deserialize, Serialize};

/// Latest snapshot of every available source. Absent sources are `None`.
#[derive(Debug, Clone, Default)]
pub struct FusionInputs {
    pub session: Option<SessionSnapshot>,
    pub idle: Option<IdleStatus>,
    pub background: Option<BackgroundIndicator>,
    /// Learned break length from the idle monitor, if any.
    pub learned_break_minutes: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionOutcome {
    pub state: UnifiedPresenceState,
    pub context: PresenceContext,
    pub score: f64,
    pub confidence: f64,
    pub availability: f64,
    pub attention: f64,
    pub receptivity: f64,
    pub predicted_return_minutes: Option<f64>,
    pub sources: Vec<SourceKind>,
}

pub fn session_value(snapshot: &SessionSnapshot) -> f64 {
    let base = match snapshot.state {
        SessionState::Active => 0.9,
        SessionState::Idle => 0.5,
        SessionState::Background => 0.4,
        SessionState::Away => 0.15,
    };
    base * engagement_multiplier(snapshot.engagement_level)
}

fn engagement_multiplier(level: EngagementLevel) -> f64 {
    match level {
        EngagementLevel::High => 1.0,
        EngagementLevel::Moderate => 0.85,
        EngagementLevel::Low => 0.7,
        EngagementLevel::Minimal => 0.55,
    }
}

pub fn idle_value(bucket: IdleBucket) -> f64 {
    match bucket {
        IdleBucket::Active => 0.95,
        IdleBucket::ShortIdle => 0.6,
        IdleBucket::MediumIdle => 0.3,
        IdleBucket::LongIdle => 0.15,
        IdleBucket::DeepIdle => 0.05,
    }
}

pub fn background_value(level: PresenceLevel) -> f64 {
    match level {
        PresenceLevel::StrongPresence => 0.9,
        PresenceLevel::LikelyPresent => 0.7,
        PresenceLevel::Uncertain => 0.5,
        PresenceLevel::LikelyAway => 0.25,
        PresenceLevel::StrongAbsence => 0.05,
    }
}

/// Maps a fused score to a state. `None` for the score means no source.
pub fn classify_state(score: Option<f64>, engagement: Option<EngagementLevel>) -> UnifiedPresenceState {
    let Some(score) = score else {
        return UnifiedPresenceState::Unknown;
    };
    if score > 0.8 && engagement == Some(EngagementLevel::High) {
        UnifiedPresenceState::HighlyEngaged
    } else if score >= 0.7 {
        UnifiedPresenceState::ActivelyPresent
    } else if score >= 0.4 {
        UnifiedPresenceState::PassivelyPresent
    } else if score >= 0.2 {
        UnifiedPresenceState::BrieflyAway
    } else if score >= 0.1 {
        UnifiedPresenceState::Away
    } else {
        UnifiedPresenceState::DeeplyAway
    }
}

fn classify_context(inputs: &FusionInputs, values: &[(SourceKind, f64)], config: &FusionConfig) -> PresenceContext {
    if values.is_empty() {
        return PresenceContext::Unknown;
    }

    if let Some(session) = &inputs.session {
        if session.interaction_rate >= config.focused_rate && session.focus_percentage >= config.focused_focus_percentage {
            return PresenceContext::FocusedSession;
        }
        if session.state == SessionState::Background {
            return PresenceContext::BackgroundMode;
        }
    }

    if let Some(idle) = &inputs.idle {
        if matches!(idle.bucket, IdleBucket::MediumIdle | IdleBucket::LongIdle) {
            return PresenceContext::BreakTime;
        }
    }

    if values.len() >= 2 {
        let (min, max) = values
            .iter()
            .fold((f64::MAX, f64::MIN), |(min, max), (_, value)| (min.min(*value), max.max(*value)));
        if max - min > config.disagreement_spread {
            return PresenceContext::Multitasking;
        }
    }

    PresenceContext::CasualBrowsing
}

fn availability_base(state: UnifiedPresenceState) -> f64 {
    match state {
        UnifiedPresenceState::HighlyEngaged => 0.3,
        UnifiedPresenceState::ActivelyPresent => 0.7,
        UnifiedPresenceState::PassivelyPresent => 0.8,
        UnifiedPresenceState::BrieflyAway => 0.5,
        UnifiedPresenceState::Away => 0.2,
        UnifiedPresenceState::DeeplyAway => 0.05,
        UnifiedPresenceState::Unknown => 0.3,
    }
}

fn availability_engagement(level: EngagementLevel) -> f64 {
    match level {
        EngagementLevel::High => 0.8,
        EngagementLevel::Moderate => 1.0,
        EngagementLevel::Low | EngagementLevel::Minimal => 1.1,
    }
}

/// How free the user is to take on something new.
pub fn availability(state: UnifiedPresenceState, session: Option<&SessionSnapshot>) -> f64 {
    let (focus, multiplier) = session.map_or((1.0, 1.0), |session| {
        (session.focus_percentage / 100.0, availability_engagement(session.engagement_level))
    });
    (availability_base(state) * (0.7 + 0.3 * focus.clamp(0.0, 1.0)) * multiplier).clamp(0.0, 1.0)
}

fn idle_attention(bucket: IdleBucket) -> f64 {
    match bucket {
        IdleBucket::Active => 1.0,
        IdleBucket::ShortIdle => 0.6,
        IdleBucket::MediumIdle => 0.3,
        IdleBucket::LongIdle => 0.1,
        IdleBucket::DeepIdle => 0.0,
    }
}

/// 60/40 blend of interaction rate and idle bucket, renormalized when one
/// side is missing.
pub fn attention(interaction_rate: Option<f64>, bucket: Option<IdleBucket>) -> f64 {
    let rate = interaction_rate.map(|rate| (rate / 2.0).clamp(0.0, 1.0));
    let idle = bucket.map(idle_attention);
    let value = match (rate, idle) {
        (Some(rate), Some(idle)) => 0.6 * rate + 0.4 * idle,
        (Some(rate), None) => rate,
        (None, Some(idle)) => idle,
        (None, None) => 0.0,
    };
    value.clamp(0.0, 1.0)
}

fn receptivity_base(state: UnifiedPresenceState) -> f64 {
    match state {
        UnifiedPresenceState::HighlyEngaged => 0.2,
        UnifiedPresenceState::ActivelyPresent => 0.6,
        UnifiedPresenceState::PassivelyPresent => 0.7,
        UnifiedPresenceState::BrieflyAway => 0.8,
        UnifiedPresenceState::Away => 0.4,
        UnifiedPresenceState::DeeplyAway => 0.1,
        UnifiedPresenceState::Unknown => 0.3,
    }
}

/// Likelihood a proactive message lands well: lower under deep attention,
/// higher when the user is available.
pub fn receptivity(state: UnifiedPresenceState, attention: f64, availability: f64) -> f64 {
    (receptivity_base(state) * (1.0 - 0.5 * attention) * (0.5 + 0.5 * availability)).clamp(0.0, 1.0)
}

/// Minutes until the user is expected back, for the away tiers only.
pub fn predicted_return(
    state: UnifiedPresenceState,
    idle_seconds: Option<f64>,
    learned_break_minutes: Option<f64>,
    config: &FusionConfig,
) -> Option<f64> {
    let fallback = match state {
        UnifiedPresenceState::BrieflyAway => config.briefly_away_return_minutes,
        UnifiedPresenceState::Away => config.away_return_minutes,
        UnifiedPresenceState::DeeplyAway => config.deeply_away_return_minutes,
        _ => return None,
    };

    match learned_break_minutes.filter(|minutes| *minutes > 0.0) {
        Some(learned) => {
            let idle_minutes = idle_seconds.unwrap_or(0.0) / 60.0;
            Some((learned - idle_minutes).max(1.0))
        }
        None => Some(fallback),
    }
}

/// One fusion step.
pub fn fuse(inputs: &FusionInputs, config: &FusionConfig) -> FusionOutcome {
    let mut values: Vec<(SourceKind, f64)> = Vec::with_capacity(3);
    if let Some(session) = &inputs.session {
        values.push((SourceKind::Session, session_value(session)));
    }
    if let Some(idle) = &inputs.idle {
        values.push((SourceKind::Idle, idle_value(idle.bucket)));
    }
    if let Some(background) = &inputs.background {
        values.push((SourceKind::Background, background_value(background.level)));
    }

    let weight_of = |source: SourceKind| match source {
        SourceKind::Session => config.session_weight,
        SourceKind::Idle => config.idle_weight,
        SourceKind::Background => config.background_weight,
    };
    let total_weight = config.session_weight + config.idle_weight + config.background_weight;
    let present_weight: f64 = values.iter().map(|(source, _)| weight_of(*source)).sum();

    let score = (present_weight > 0.0).then(|| {
        let weighted: f64 = values.iter().map(|(source, value)| weight_of(*source) * value).sum();
        (weighted / present_weight).clamp(0.0, 1.0)
    });
    let confidence = if total_weight > 0.0 {
        (present_weight / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let engagement = inputs.session.as_ref().map(|session| session.engagement_level);
    let state = classify_state(score, engagement);
    let context = classify_context(inputs, &values, config);

    let availability = availability(state, inputs.session.as_ref());
    let attention = attention(
        inputs.session.as_ref().map(|session| session.interaction_rate),
        inputs.idle.as_ref().map(|idle| idle.bucket),
    );
    let receptivity = receptivity(state, attention, availability);
    let predicted_return_minutes = predicted_return(
        state,
        inputs.idle.as_ref().map(|idle| idle.idle_seconds),
        inputs.learned_break_minutes,
        config,
    );

    FusionOutcome {
        state,
        context,
        score: score.unwrap_or(0.0),
        confidence,
        availability,
        attention,
        receptivity,
        predicted_return_minutes,
        sources: values.into_iter().map(|(source, _)| source).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn session(state: SessionState, engagement: EngagementLevel, rate: f64, focus: f64) -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            session_id: "s".to_string(),
            user_id: "u".to_string(),
            state,
            engagement_level: engagement,
            interaction_rate: rate,
            focus_percentage: focus,
            last_interaction_age_secs: 0.0,
            interaction_count: 1,
            started_at: now,
            taken_at: now,
        }
    }

    fn idle(bucket: IdleBucket, idle_seconds: f64) -> IdleStatus {
        let now = Utc::now();
        IdleStatus {
            user_id: "u".to_string(),
            bucket,
            idle_seconds,
            recent_activity_counts: BTreeMap::new(),
            last_activity: now,
            taken_at: now,
        }
    }

    #[test]
    fn test_no_sources_is_unknown() {
        let outcome = fuse(&FusionInputs::default(), &FusionConfig::default());
        assert_eq!(outcome.state, UnifiedPresenceState::Unknown);
        assert_eq!(outcome.context, PresenceContext::Unknown);
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.sources.is_empty());
        assert_eq!(outcome.predicted_return_minutes, None);
    }

    #[test]
    fn test_highly_engaged_requires_high_engagement() {
        let config = FusionConfig::default();
        let mut inputs = FusionInputs {
            session: Some(session(SessionState::Active, EngagementLevel::High, 3.0, 100.0)),
            idle: Some(idle(IdleBucket::Active, 2.0)),
            ..Default::default()
        };
        let outcome = fuse(&inputs, &config);
        assert_eq!(outcome.state, UnifiedPresenceState::HighlyEngaged);
        assert_eq!(outcome.context, PresenceContext::FocusedSession);
        assert!((outcome.confidence - 0.7).abs() < 1e-9);

        inputs.session = Some(session(SessionState::Active, EngagementLevel::Moderate, 0.9, 100.0));
        let outcome = fuse(&inputs, &config);
        assert_eq!(outcome.state, UnifiedPresenceState::ActivelyPresent);
    }

    #[test]
    fn test_score_is_weighted_over_present_sources() {
        let config = FusionConfig::default();
        let inputs = FusionInputs {
            idle: Some(idle(IdleBucket::DeepIdle, 4000.0)),
            ..Default::default()
        };
        let outcome = fuse(&inputs, &config);
        assert!((outcome.score - 0.05).abs() < 1e-9);
        assert_eq!(outcome.state, UnifiedPresenceState::DeeplyAway);
        assert_eq!(outcome.predicted_return_minutes, Some(30.0));
        assert!((outcome.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_background_session_wins_context() {
        let config = FusionConfig::default();
        let inputs = FusionInputs {
            session: Some(session(SessionState::Background, EngagementLevel::Low, 0.2, 30.0)),
            idle: Some(idle(IdleBucket::MediumIdle, 400.0)),
            ..Default::default()
        };
        assert_eq!(fuse(&inputs, &config).context, PresenceContext::BackgroundMode);
    }

    #[test]
    fn test_disagreeing_sources_mean_multitasking() {
        let config = FusionConfig::default();
        let inputs = FusionInputs {
            session: Some(session(SessionState::Away, EngagementLevel::Minimal, 0.0, 100.0)),
            idle: Some(idle(IdleBucket::Active, 5.0)),
            ..Default::default()
        };
        assert_eq!(fuse(&inputs, &config).context, PresenceContext::Multitasking);
    }

    #[test]
    fn test_learned_break_drives_predicted_return() {
        let config = FusionConfig::default();
        assert_eq!(predicted_return(UnifiedPresenceState::Away, Some(300.0), Some(15.0), &config), Some(10.0));
        assert_eq!(predicted_return(UnifiedPresenceState::Away, Some(3000.0), Some(15.0), &config), Some(1.0));
        assert_eq!(predicted_return(UnifiedPresenceState::BrieflyAway, None, None, &config), Some(2.0));
        assert_eq!(predicted_return(UnifiedPresenceState::PassivelyPresent, None, Some(15.0), &config), None);
    }

    #[test]
    fn test_attention_and_receptivity_bounds() {
        assert_eq!(attention(None, None), 0.0);
        assert!((attention(Some(4.0), Some(IdleBucket::Active)) - 1.0).abs() < 1e-9);
        assert!((attention(None, Some(IdleBucket::MediumIdle)) - 0.3).abs() < 1e-9);
        for state in UnifiedPresenceState::ALL {
            for value in [0.0, 0.5, 1.0] {
                let r = receptivity(state, value, value);
                assert!((0.0..=1.0).contains(&r));
            }
        }
        assert!(
            receptivity(UnifiedPresenceState::BrieflyAway, 0.1, 0.6)
                > receptivity(UnifiedPresenceState::HighlyEngaged, 0.9, 0.3)
        );
    }

    #[test]
    fn test_fuse_is_deterministic() {
        let config = FusionConfig::default();
        let inputs = FusionInputs {
            session: Some(session(SessionState::Idle, EngagementLevel::Low, 0.2, 70.0)),
            idle: Some(idle(IdleBucket::ShortIdle, 90.0)),
            ..Default::default()
        };
        assert_eq!(fuse(&inputs, &config), fuse(&inputs, &config));
    }
}
