//! Configuration management for presenced.
//!
//! All detector thresholds, fusion weights and loop periods live in a single
//! JSON file stored in the platform data directory. Every section has sensible
//! defaults, so a missing file or a partially written one is never an error.
//! Values that would break detector invariants (unordered thresholds, decay
//! factors outside the unit interval, all-zero fusion weights) are rejected
//! when the file is read.
//!
//! ## Configuration Structure
//!
//! - **Session**: interaction-cadence thresholds and engagement tiers
//! - **Idle**: idle bucket boundaries and pattern learning
//! - **Sensor**: background signal aggregation and sampling
//! - **Fusion**: source weights, staleness and fusion loop period
//! - **Watch**: defaults for the `watch` command
//!
//! ## Usage Examples
//!
//! ```rust,no_run
//! use presenced::libs::config::Config;
//!
//! let config = Config::read()?;
//! let presence = config.presence_or_default();
//! println!("fusion runs every {}s", presence.fusion.interval_secs);
//! # Ok::<(), anyhow::Error>(())
//! ```

use super::data_storage::DataStorage;
use crate::libs::error::PresenceError;
use crate::libs::messages::Message;
use crate::msg_print;
use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Input, MultiSelect};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};

/// Configuration file name used for storing application settings.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Represents a configurable module in the interactive setup.
#[derive(Debug, Clone)]
pub struct ConfigModule {
    /// Unique identifier for the module used in configuration routing
    pub key: String,
    /// Display name shown to users during interactive setup
    pub name: String,
}

/// Session Interaction Tracker settings.
///
/// State thresholds are measured from the most recent interaction:
/// a session is ACTIVE below `idle_after_secs`, IDLE below `away_after_secs`,
/// AWAY below `end_after_secs` and ends once that last threshold is reached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence in seconds before an ACTIVE session becomes IDLE.
    pub idle_after_secs: u64,
    /// Silence in seconds before a session becomes AWAY.
    pub away_after_secs: u64,
    /// Silence in seconds after which the session is ended.
    pub end_after_secs: u64,
    /// Rolling window in seconds used to compute the interaction rate.
    pub rate_window_secs: u64,
    /// Interactions per minute required for HIGH engagement.
    pub high_rate: f64,
    /// Interactions per minute required for MODERATE engagement.
    pub moderate_rate: f64,
    /// Interactions per minute required for LOW engagement.
    pub low_rate: f64,
    /// Focus percentage below which engagement is downgraded one tier.
    pub min_focus_percentage: f64,
    /// How long interaction events are kept, in seconds.
    pub retention_secs: u64,
    /// Hard cap on buffered events per session.
    pub max_events: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            idle_after_secs: 60,
            away_after_secs: 300,
            end_after_secs: 1800,
            rate_window_secs: 300,
            high_rate: 2.0,
            moderate_rate: 0.5,
            low_rate: 0.1,
            min_focus_percentage: 50.0,
            retention_secs: 7200,
            max_events: 1000,
        }
    }
}

/// Idle/Activity Monitor settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    /// Seconds without activity before SHORT_IDLE.
    pub short_idle_after_secs: u64,
    /// Seconds without activity before MEDIUM_IDLE.
    pub medium_idle_after_secs: u64,
    /// Seconds without activity before LONG_IDLE.
    pub long_idle_after_secs: u64,
    /// Seconds without activity before DEEP_IDLE.
    pub deep_idle_after_secs: u64,
    /// A return to ACTIVE observed within this many seconds of the new
    /// activity counts as "returned from idle".
    pub return_window_secs: u64,
    /// Gaps longer than this split activity history into separate sessions.
    pub session_gap_secs: u64,
    /// Window in seconds for the per-kind recent activity counts.
    pub recent_window_secs: u64,
    /// Fraction of pattern weight lost per week of age.
    pub pattern_decay_per_week: f64,
    /// Period of the bucket re-evaluation loop.
    pub reevaluate_interval_secs: u64,
    /// How long activity events are kept, in seconds.
    pub retention_secs: u64,
    /// Hard cap on buffered events per user.
    pub max_events: usize,
}

impl Default for IdleConfig {
    fn default() -> Self {
        IdleConfig {
            short_idle_after_secs: 60,
            medium_idle_after_secs: 300,
            long_idle_after_secs: 900,
            deep_idle_after_secs: 1800,
            return_window_secs: 30,
            session_gap_secs: 900,
            recent_window_secs: 300,
            pattern_decay_per_week: 0.1,
            reevaluate_interval_secs: 10,
            retention_secs: 7200,
            max_events: 5000,
        }
    }
}

/// Background Signal Sensor settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SensorConfig {
    /// Readings younger than this many seconds take part in aggregation.
    pub window_secs: u64,
    /// Minimum number of distinct sensor kinds before evidence counts as solid.
    pub min_sensor_kinds: usize,
    /// Multiplier applied to confidence when evidence is thin.
    pub thin_evidence_penalty: f64,
    /// Multiplier applied to the previous confidence when no reading is recent.
    pub stale_decay: f64,
    /// Confidence assumed before the first aggregation.
    pub initial_confidence: f64,
    /// Period of the probe sampling loop.
    pub sample_interval_secs: u64,
    /// Period of the aggregation loop.
    pub aggregate_interval_secs: u64,
    /// How long readings are kept, in seconds.
    pub retention_secs: u64,
    /// Hard cap on buffered readings per user.
    pub max_readings: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            window_secs: 300,
            min_sensor_kinds: 2,
            thin_evidence_penalty: 0.7,
            stale_decay: 0.5,
            initial_confidence: 0.5,
            sample_interval_secs: 30,
            aggregate_interval_secs: 15,
            retention_secs: 7200,
            max_readings: 2000,
        }
    }
}

/// Presence Orchestrator settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    /// Period of the fusion loop in seconds.
    pub interval_secs: u64,
    pub session_weight: f64,
    pub idle_weight: f64,
    pub background_weight: f64,
    /// The background source is skipped when its newest reading is older.
    pub background_stale_secs: u64,
    /// Interaction rate (per minute) that qualifies a focused session.
    pub focused_rate: f64,
    /// Focus percentage that qualifies a focused session.
    pub focused_focus_percentage: f64,
    /// Spread between source values that signals multitasking.
    pub disagreement_spread: f64,
    /// Predicted return used for BRIEFLY_AWAY when nothing was learned.
    pub briefly_away_return_minutes: f64,
    /// Predicted return used for AWAY when nothing was learned.
    pub away_return_minutes: f64,
    /// Predicted return used for DEEPLY_AWAY when nothing was learned.
    pub deeply_away_return_minutes: f64,
    /// Transition history older than this is pruned.
    pub history_retention_days: i64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            interval_secs: 15,
            session_weight: 0.4,
            idle_weight: 0.3,
            background_weight: 0.3,
            background_stale_secs: 600,
            focused_rate: 1.0,
            focused_focus_percentage: 80.0,
            disagreement_spread: 0.4,
            briefly_away_return_minutes: 2.0,
            away_return_minutes: 10.0,
            deeply_away_return_minutes: 30.0,
            history_retention_days: 30,
        }
    }
}

/// All presence engine tunables.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct PresenceConfig {
    pub session: SessionConfig,
    pub idle: IdleConfig,
    pub sensor: SensorConfig,
    pub fusion: FusionConfig,
}

fn ensure(ok: bool, rule: &str) -> Result<(), PresenceError> {
    if ok {
        Ok(())
    } else {
        Err(PresenceError::InvalidConfig(rule.to_string()))
    }
}

fn is_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

fn is_percentage(value: f64) -> bool {
    value.is_finite() && (0.0..=100.0).contains(&value)
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), PresenceError> {
        ensure(
            0 < self.idle_after_secs && self.idle_after_secs < self.away_after_secs && self.away_after_secs < self.end_after_secs,
            "session thresholds must satisfy 0 < idle_after_secs < away_after_secs < end_after_secs",
        )?;
        ensure(self.rate_window_secs > 0, "session rate_window_secs must be positive")?;
        ensure(
            self.low_rate.is_finite()
                && self.high_rate.is_finite()
                && 0.0 <= self.low_rate
                && self.low_rate <= self.moderate_rate
                && self.moderate_rate <= self.high_rate,
            "session rates must satisfy 0 <= low_rate <= moderate_rate <= high_rate",
        )?;
        ensure(is_percentage(self.min_focus_percentage), "session min_focus_percentage must be within [0, 100]")?;
        ensure(self.max_events > 0, "session max_events must be positive")
    }
}

impl IdleConfig {
    pub fn validate(&self) -> Result<(), PresenceError> {
        ensure(
            0 < self.short_idle_after_secs
                && self.short_idle_after_secs < self.medium_idle_after_secs
                && self.medium_idle_after_secs < self.long_idle_after_secs
                && self.long_idle_after_secs < self.deep_idle_after_secs,
            "idle thresholds must satisfy 0 < short < medium < long < deep",
        )?;
        ensure(self.session_gap_secs > 0, "idle session_gap_secs must be positive")?;
        ensure(
            self.pattern_decay_per_week.is_finite() && (0.0..1.0).contains(&self.pattern_decay_per_week),
            "idle pattern_decay_per_week must be within [0, 1)",
        )?;
        ensure(self.max_events > 0, "idle max_events must be positive")
    }
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), PresenceError> {
        ensure(self.window_secs > 0, "sensor window_secs must be positive")?;
        ensure(
            self.stale_decay.is_finite() && 0.0 < self.stale_decay && self.stale_decay < 1.0,
            "sensor stale_decay must be within (0, 1)",
        )?;
        ensure(is_unit(self.thin_evidence_penalty), "sensor thin_evidence_penalty must be within [0, 1]")?;
        ensure(is_unit(self.initial_confidence), "sensor initial_confidence must be within [0, 1]")?;
        ensure(self.max_readings > 0, "sensor max_readings must be positive")
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), PresenceError> {
        let weights = [self.session_weight, self.idle_weight, self.background_weight];
        ensure(
            weights.iter().all(|weight| weight.is_finite() && *weight >= 0.0) && weights.iter().sum::<f64>() > 0.0,
            "fusion weights must be non-negative and not all zero",
        )?;
        ensure(is_unit(self.disagreement_spread), "fusion disagreement_spread must be within [0, 1]")?;
        ensure(
            is_percentage(self.focused_focus_percentage),
            "fusion focused_focus_percentage must be within [0, 100]",
        )?;
        ensure(
            [self.briefly_away_return_minutes, self.away_return_minutes, self.deeply_away_return_minutes]
                .iter()
                .all(|minutes| minutes.is_finite() && *minutes >= 0.0),
            "fusion fallback return minutes must be non-negative",
        )
    }
}

impl PresenceConfig {
    /// Checks every section, reporting the first broken rule.
    pub fn validate(&self) -> Result<(), PresenceError> {
        self.session.validate()?;
        self.idle.validate()?;
        self.sensor.validate()?;
        self.fusion.validate()
    }
}

/// Defaults for the `watch` command.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    /// User id the local monitor reports under.
    pub user_id: String,
    /// Sample system load and network activity.
    pub system_probe: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            user_id: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "local".to_string()),
            system_probe: true,
        }
    }
}

/// Main configuration container.
///
/// Both sections are optional so that an empty file stays valid; unset
/// sections are omitted when the file is written back.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<WatchConfig>,
}

impl Config {
    /// Reads configuration from the data directory, falling back to defaults
    /// when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if its presence section fails [`PresenceConfig::validate`].
    pub fn read() -> Result<Config> {
        let config_file_path = DataStorage::new().get_path(CONFIG_FILE_NAME)?;

        if !config_file_path.exists() {
            return Ok(Config::default());
        }

        let config_str = fs::read_to_string(config_file_path)?;
        let config: Config = serde_json::from_str(&config_str)?;
        if let Some(presence) = &config.presence {
            presence.validate()?;
        }
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self) -> Result<()> {
        let config_file_path = DataStorage::new().get_path(CONFIG_FILE_NAME)?;
        let config_file = File::create(config_file_path)?;
        serde_json::to_writer_pretty(&config_file, &self)?;
        Ok(())
    }

    /// Removes the configuration file if present.
    pub fn delete() -> Result<()> {
        let config_file_path = DataStorage::new().get_path(CONFIG_FILE_NAME)?;
        if config_file_path.exists() {
            fs::remove_file(config_file_path)?;
        }
        Ok(())
    }

    pub fn presence_or_default(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }

    pub fn watch_or_default(&self) -> WatchConfig {
        self.watch.clone().unwrap_or_default()
    }

    /// Runs the interactive setup wizard.
    ///
    /// Existing values are offered as defaults, so pressing enter through
    /// every prompt leaves the configuration unchanged.
    pub fn init() -> Result<Self> {
        let mut config = Self::read().unwrap_or_default();

        let modules = [
            ConfigModule {
                key: "session".to_string(),
                name: Message::ConfigModuleSession.to_string(),
            },
            ConfigModule {
                key: "idle".to_string(),
                name: Message::ConfigModuleIdle.to_string(),
            },
            ConfigModule {
                key: "fusion".to_string(),
                name: Message::ConfigModuleFusion.to_string(),
            },
            ConfigModule {
                key: "watch".to_string(),
                name: Message::ConfigModuleWatch.to_string(),
            },
        ];

        let selected = MultiSelect::with_theme(&ColorfulTheme::default())
            .with_prompt(Message::PromptSelectModules.to_string())
            .items(&modules.iter().map(|module| &module.name).collect::<Vec<_>>())
            .interact()?;

        let mut presence = config.presence_or_default();

        for &selection in &selected {
            match modules[selection].key.as_str() {
                "session" => {
                    msg_print!(Message::ConfigModuleSession);
                    presence.session.idle_after_secs = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptSessionIdleAfter.to_string())
                        .default(presence.session.idle_after_secs)
                        .interact_text()?;
                    presence.session.away_after_secs = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptSessionAwayAfter.to_string())
                        .default(presence.session.away_after_secs)
                        .interact_text()?;
                    presence.session.end_after_secs = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptSessionEndAfter.to_string())
                        .default(presence.session.end_after_secs)
                        .interact_text()?;
                }
                "idle" => {
                    msg_print!(Message::ConfigModuleIdle);
                    presence.idle.reevaluate_interval_secs = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptIdleReevaluateInterval.to_string())
                        .default(presence.idle.reevaluate_interval_secs)
                        .interact_text()?;
                    presence.idle.session_gap_secs = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptIdleSessionGap.to_string())
                        .default(presence.idle.session_gap_secs)
                        .interact_text()?;
                }
                "fusion" => {
                    msg_print!(Message::ConfigModuleFusion);
                    presence.fusion.interval_secs = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptFusionInterval.to_string())
                        .default(presence.fusion.interval_secs)
                        .interact_text()?;
                    presence.fusion.history_retention_days = Input::with_theme(&ColorfulTheme::default())
                        .with_prompt(Message::PromptHistoryRetention.to_string())
                        .default(presence.fusion.history_retention_days)
                        .interact_text()?;
                }
                "watch" => {
                    let default = config.watch_or_default();
                    msg_print!(Message::ConfigModuleWatch);
                    config.watch = Some(WatchConfig {
                        user_id: Input::with_theme(&ColorfulTheme::default())
                            .with_prompt(Message::PromptWatchUserId.to_string())
                            .default(default.user_id)
                            .interact_text()?,
                        system_probe: Input::with_theme(&ColorfulTheme::default())
                            .with_prompt(Message::PromptWatchSystemProbe.to_string())
                            .default(default.system_probe)
                            .interact_text()?,
                    });
                }
                _ => {}
            }
        }

        presence.validate()?;
        config.presence = Some(presence);
        Ok(config)
    }
}
