//! Background Signal Sensor.
//!
//! Collects ambient, non-interactive signals (application focus, browser
//! visibility, coarse system load, audio, network traffic, screen lock) and
//! folds them into a weighted presence confidence.
//!
//! ## Aggregation
//!
//! Every cycle looks at readings from the last `window_secs`:
//!
//! 1. Per sensor kind, average the reading values.
//! 2. Combine the per-kind means weighted by [`SensorKind::weight`], normalized
//!    by the weights of the kinds that actually contributed.
//! 3. When fewer than `min_sensor_kinds` kinds contributed, multiply by
//!    `thin_evidence_penalty`.
//!
//! Without any recent reading the previous confidence is multiplied by
//! `stale_decay`, so it fades towards STRONG_ABSENCE instead of dropping there
//! in one step.

use crate::libs::clock::{secs_between, ClockRef};
use crate::libs::config::SensorConfig;
use crate::libs::error::{require_metadata, require_unit, PresenceError};
use crate::libs::messages::Message;
use crate::libs::probe::SignalProbe;
use crate::{msg_debug, msg_info, msg_warning};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    AppFocus,
    Browser,
    SystemActivity,
    Audio,
    Network,
    ScreenLock,
}

impl SensorKind {
    pub const ALL: [SensorKind; 6] = [
        SensorKind::AppFocus,
        SensorKind::Browser,
        SensorKind::SystemActivity,
        SensorKind::Audio,
        SensorKind::Network,
        SensorKind::ScreenLock,
    ];

    /// Relative trust placed in this kind. Weights do not sum to one; they are
    /// normalized over the kinds present in each aggregation.
    pub fn weight(&self) -> f64 {
        match self {
            SensorKind::AppFocus => 0.40,
            SensorKind::Browser => 0.30,
            SensorKind::SystemActivity => 0.20,
            SensorKind::Audio => 0.15,
            SensorKind::Network => 0.10,
            SensorKind::ScreenLock => 0.25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::AppFocus => "app_focus",
            SensorKind::Browser => "browser",
            SensorKind::SystemActivity => "system_activity",
            SensorKind::Audio => "audio",
            SensorKind::Network => "network",
            SensorKind::ScreenLock => "screen_lock",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        SensorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| PresenceError::UnknownSensorKind(s.to_string()))
    }
}

/// A single observed ambient signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Focus,
    Blur,
    Visible,
    Hidden,
    Interaction,
    Locked,
    Unlocked,
    AudioActive,
    AudioSilent,
    NetworkActive,
    NetworkIdle,
    /// A raw presence value in `[0, 1]`.
    Level(f64),
}

impl Signal {
    pub fn value(&self) -> f64 {
        match self {
            Signal::Focus => 0.9,
            Signal::Blur => 0.1,
            Signal::Visible => 0.7,
            Signal::Hidden => 0.2,
            Signal::Interaction => 0.8,
            Signal::Locked => 0.1,
            Signal::Unlocked => 0.9,
            Signal::AudioActive => 0.6,
            Signal::AudioSilent => 0.3,
            Signal::NetworkActive => 0.6,
            Signal::NetworkIdle => 0.3,
            Signal::Level(value) => *value,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Focus => f.write_str("focus"),
            Signal::Blur => f.write_str("blur"),
            Signal::Visible => f.write_str("visible"),
            Signal::Hidden => f.write_str("hidden"),
            Signal::Interaction => f.write_str("interaction"),
            Signal::Locked => f.write_str("locked"),
            Signal::Unlocked => f.write_str("unlocked"),
            Signal::AudioActive => f.write_str("audio_active"),
            Signal::AudioSilent => f.write_str("audio_silent"),
            Signal::NetworkActive => f.write_str("network_active"),
            Signal::NetworkIdle => f.write_str("network_idle"),
            Signal::Level(value) => write!(f, "{:.2}", value),
        }
    }
}

impl FromStr for Signal {
    type Err = PresenceError;

    /// Accepts a signal name or a bare number, which becomes [`Signal::Level`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let signal = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "focus" => Signal::Focus,
            "blur" => Signal::Blur,
            "visible" => Signal::Visible,
            "hidden" => Signal::Hidden,
            "interaction" => Signal::Interaction,
            "lock" | "locked" | "screen_lock" => Signal::Locked,
            "unlock" | "unlocked" | "screen_unlock" => Signal::Unlocked,
            "audio_active" => Signal::AudioActive,
            "audio_silent" => Signal::AudioSilent,
            "network_active" => Signal::NetworkActive,
            "network_idle" => Signal::NetworkIdle,
            other => {
                let value: f64 = other.parse().map_err(|_| PresenceError::UnknownSignal(s.to_string()))?;
                Signal::Level(require_unit(value, PresenceError::InvalidSignalValue)?)
            }
        };
        Ok(signal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub user_id: String,
    pub kind: SensorKind,
    pub signal: Signal,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Five-level presence indicator, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceLevel {
    StrongPresence,
    LikelyPresent,
    Uncertain,
    LikelyAway,
    StrongAbsence,
}

impl fmt::Display for PresenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PresenceLevel::StrongPresence => "STRONG_PRESENCE",
            PresenceLevel::LikelyPresent => "LIKELY_PRESENT",
            PresenceLevel::Uncertain => "UNCERTAIN",
            PresenceLevel::LikelyAway => "LIKELY_AWAY",
            PresenceLevel::StrongAbsence => "STRONG_ABSENCE",
        };
        f.write_str(label)
    }
}

pub fn classify_confidence(confidence: f64) -> PresenceLevel {
    if confidence >= 0.7 {
        PresenceLevel::StrongPresence
    } else if confidence >= 0.4 {
        PresenceLevel::LikelyPresent
    } else if confidence >= 0.2 {
        PresenceLevel::Uncertain
    } else if confidence > 0.1 {
        PresenceLevel::LikelyAway
    } else {
        PresenceLevel::StrongAbsence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundIndicator {
    pub user_id: String,
    pub level: PresenceLevel,
    pub confidence: f64,
    /// Number of distinct sensor kinds behind the last non-stale aggregation.
    pub contributing_sensors: usize,
    pub sensor_kinds: Vec<SensorKind>,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

/// Weighted confidence over the readings newer than `window_secs`.
///
/// Returns `None` when no reading falls inside the window.
pub fn weighted_confidence<'a>(
    readings: impl IntoIterator<Item = &'a SensorReading>,
    now: DateTime<Utc>,
    config: &SensorConfig,
) -> Option<(f64, Vec<SensorKind>)> {
    let cutoff = now - Duration::seconds(config.window_secs as i64);
    let mut per_kind: BTreeMap<SensorKind, (f64, usize)> = BTreeMap::new();
    for reading in readings.into_iter().filter(|reading| reading.timestamp >= cutoff) {
        let entry = per_kind.entry(reading.kind).or_insert((0.0, 0));
        entry.0 += reading.value;
        entry.1 += 1;
    }
    if per_kind.is_empty() {
        return None;
    }

    let (weighted, total_weight) = per_kind.iter().fold((0.0, 0.0), |(weighted, total), (kind, (sum, count))| {
        let mean = sum / *count as f64;
        (weighted + kind.weight() * mean, total + kind.weight())
    });

    let mut confidence = weighted / total_weight;
    if per_kind.len() < config.min_sensor_kinds {
        confidence *= config.thin_evidence_penalty;
    }

    Some((confidence.clamp(0.0, 1.0), per_kind.into_keys().collect()))
}

#[derive(Debug)]
struct UserSignals {
    readings: VecDeque<SensorReading>,
    indicator: BackgroundIndicator,
}

impl UserSignals {
    fn new(user_id: &str, now: DateTime<Utc>, config: &SensorConfig) -> Self {
        let confidence = config.initial_confidence.clamp(0.0, 1.0);
        Self {
            readings: VecDeque::new(),
            indicator: BackgroundIndicator {
                user_id: user_id.to_string(),
                level: classify_confidence(confidence),
                confidence,
                contributing_sensors: 0,
                sensor_kinds: Vec::new(),
                last_reading_at: None,
                computed_at: now,
            },
        }
    }

    fn push(&mut self, reading: SensorReading, config: &SensorConfig) {
        let at = reading.timestamp;
        self.readings.push_back(reading);
        let cutoff = at - Duration::seconds(config.retention_secs as i64);
        while self.readings.front().is_some_and(|reading| reading.timestamp < cutoff) {
            self.readings.pop_front();
        }
        while self.readings.len() > config.max_readings {
            self.readings.pop_front();
        }
    }
}

/// Per-user ambient signal aggregation.
pub struct BackgroundSensor {
    config: SensorConfig,
    clock: ClockRef,
    probes: Vec<Arc<dyn SignalProbe>>,
    users: DashMap<String, UserSignals>,
}

impl BackgroundSensor {
    pub fn new(config: SensorConfig, clock: ClockRef) -> Self {
        Self::with_probes(config, clock, Vec::new())
    }

    pub fn with_probes(config: SensorConfig, clock: ClockRef, probes: Vec<Arc<dyn SignalProbe>>) -> Self {
        Self {
            config,
            clock,
            probes,
            users: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn has_probes(&self) -> bool {
        !self.probes.is_empty()
    }

    pub fn start(&self, user_id: &str) {
        let now = self.clock.now();
        self.users.insert(user_id.to_string(), UserSignals::new(user_id, now, &self.config));
        msg_info!(Message::SensorStarted(user_id.to_string()));
    }

    pub fn is_monitoring(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Records one reading. Returns `Ok(false)` when the user is not monitored.
    pub fn record_signal(
        &self,
        user_id: &str,
        kind: SensorKind,
        signal: Signal,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool, PresenceError> {
        require_metadata(metadata.as_ref())?;
        let value = require_unit(signal.value(), PresenceError::InvalidSignalValue)?;
        let now = self.clock.now();

        let Some(mut user) = self.users.get_mut(user_id) else {
            msg_warning!(Message::SensorUserNotMonitored(user_id.to_string()));
            return Ok(false);
        };

        user.push(
            SensorReading {
                user_id: user_id.to_string(),
                kind,
                signal,
                value,
                timestamp: now,
                metadata,
            },
            &self.config,
        );
        msg_debug!(Message::SignalRecorded(user_id.to_string(), kind.to_string(), signal.to_string()));
        Ok(true)
    }

    /// Runs one aggregation cycle and stores the resulting indicator.
    pub fn aggregate(&self, user_id: &str) -> Option<BackgroundIndicator> {
        let now = self.clock.now();
        let mut user = self.users.get_mut(user_id)?;

        let last_reading_at = user.readings.back().map(|reading| reading.timestamp);
        let previous = user.indicator.confidence;

        let indicator = match weighted_confidence(user.readings.iter(), now, &self.config) {
            Some((confidence, sensor_kinds)) => BackgroundIndicator {
                user_id: user_id.to_string(),
                level: classify_confidence(confidence),
                confidence,
                contributing_sensors: sensor_kinds.len(),
                sensor_kinds,
                last_reading_at,
                computed_at: now,
            },
            None => {
                let confidence = (previous * self.config.stale_decay).clamp(0.0, 1.0);
                BackgroundIndicator {
                    user_id: user_id.to_string(),
                    level: classify_confidence(confidence),
                    confidence,
                    contributing_sensors: 0,
                    sensor_kinds: Vec::new(),
                    last_reading_at,
                    computed_at: now,
                }
            }
        };

        if indicator.level != user.indicator.level {
            msg_debug!(Message::BackgroundLevelChanged(
                user_id.to_string(),
                user.indicator.level.to_string(),
                indicator.level.to_string()
            ));
        }
        user.indicator = indicator.clone();
        Some(indicator)
    }

    /// Latest indicator produced by [`aggregate`](Self::aggregate).
    pub fn indicator(&self, user_id: &str) -> Option<BackgroundIndicator> {
        self.users.get(user_id).map(|user| user.indicator.clone())
    }

    /// Polls every probe once and records what they report for `user_id`.
    ///
    /// A failing or panicking probe is logged and skipped. Returns the number of readings
    /// recorded.
    pub fn sample(&self, user_id: &str) -> usize {
        if !self.is_monitoring(user_id) {
            return 0;
        }

        let mut recorded = 0;
        for probe in &self.probes {
            let sampled = panic::catch_unwind(AssertUnwindSafe(|| probe.sample())).unwrap_or_else(|_| {
                Err(PresenceError::ProbeFailed {
                    probe: probe.name().to_string(),
                    reason: "probe panicked".to_string(),
                })
            });
            match sampled {
                Ok(signals) => {
                    for (kind, signal) in signals {
                        match self.record_signal(user_id, kind, signal, None) {
                            Ok(true) => recorded += 1,
                            Ok(false) => return recorded,
                            Err(e) => msg_warning!(Message::ProbeSampleFailed(probe.name().to_string(), e.to_string())),
                        }
                    }
                }
                Err(e) => msg_warning!(Message::ProbeSampleFailed(probe.name().to_string(), e.to_string())),
            }
        }
        recorded
    }

    /// Number of buffered readings, mostly useful for diagnostics.
    pub fn reading_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map_or(0, |user| user.readings.len())
    }

    pub fn stop(&self, user_id: &str) -> Option<BackgroundIndicator> {
        let (_, user) = self.users.remove(user_id)?;
        msg_info!(Message::SensorStopped(user_id.to_string()));
        Some(user.indicator)
    }

    /// Seconds since the newest reading for a user, if any.
    pub fn last_reading_age(&self, user_id: &str) -> Option<f64> {
        let now = self.clock.now();
        self.users
            .get(user_id)
            .and_then(|user| user.readings.back().map(|reading| secs_between(reading.timestamp, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(kind: SensorKind, signal: Signal, at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            user_id: "u".to_string(),
            kind,
            signal,
            value: signal.value(),
            timestamp: at,
            metadata: None,
        }
    }

    #[test]
    fn test_confidence_levels() {
        assert_eq!(classify_confidence(0.7), PresenceLevel::StrongPresence);
        assert_eq!(classify_confidence(0.69), PresenceLevel::LikelyPresent);
        assert_eq!(classify_confidence(0.4), PresenceLevel::LikelyPresent);
        assert_eq!(classify_confidence(0.2), PresenceLevel::Uncertain);
        assert_eq!(classify_confidence(0.11), PresenceLevel::LikelyAway);
        assert_eq!(classify_confidence(0.1), PresenceLevel::StrongAbsence);
        assert_eq!(classify_confidence(0.0), PresenceLevel::StrongAbsence);
    }

    #[test]
    fn test_single_kind_is_penalized() {
        let now = Utc::now();
        let config = SensorConfig::default();
        let readings = [reading(SensorKind::AppFocus, Signal::Focus, now)];
        let (confidence, kinds) = weighted_confidence(readings.iter(), now, &config).unwrap();
        assert!((confidence - 0.63).abs() < 1e-9);
        assert_eq!(kinds, vec![SensorKind::AppFocus]);
    }

    #[test]
    fn test_weights_normalized_over_present_kinds() {
        let now = Utc::now();
        let config = SensorConfig::default();
        let readings = [
            reading(SensorKind::AppFocus, Signal::Focus, now),
            reading(SensorKind::ScreenLock, Signal::Locked, now),
        ];
        let (confidence, _) = weighted_confidence(readings.iter(), now, &config).unwrap();
        let expected = (0.40 * 0.9 + 0.25 * 0.1) / 0.65;
        assert!((confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_old_readings_are_ignored() {
        let now = Utc::now();
        let config = SensorConfig::default();
        let readings = [reading(SensorKind::AppFocus, Signal::Focus, now - Duration::seconds(301))];
        assert!(weighted_confidence(readings.iter(), now, &config).is_none());
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!("screen-lock".parse::<Signal>(), Ok(Signal::Locked));
        assert_eq!("0.25".parse::<Signal>(), Ok(Signal::Level(0.25)));
        assert_eq!("1.5".parse::<Signal>(), Err(PresenceError::InvalidSignalValue(1.5)));
        assert!(matches!("wave".parse::<Signal>(), Err(PresenceError::UnknownSignal(_))));
        assert_eq!("App-Focus".parse::<SensorKind>(), Ok(SensorKind::AppFocus));
    }
}
