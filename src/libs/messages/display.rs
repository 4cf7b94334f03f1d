//! Text for every [`Message`] variant.

use super::types::Message;
use std::fmt::{Display, Formatter, Result};

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let text = match self {
            // === SESSION MESSAGES ===
            Message::SessionStarted(session_id, user_id) => format!("Session {} started for {}", session_id, user_id),
            Message::SessionNotFound(session_id) => format!("Session {} is not tracked", session_id),
            Message::SessionExpired(session_id) => format!("Session {} expired after inactivity", session_id),
            Message::SessionEnded(session_id, interactions, secs) => {
                format!("Session {} ended: {} interactions over {}s", session_id, interactions, secs)
            }
            Message::InteractionRecorded(session_id, kind) => format!("Session {}: {} recorded", session_id, kind),

            // === IDLE MONITOR MESSAGES ===
            Message::IdleMonitorStarted(user_id) => format!("Idle monitoring started for {}", user_id),
            Message::IdleMonitorStopped(user_id) => format!("Idle monitoring stopped for {}", user_id),
            Message::IdleUserNotMonitored(user_id) => format!("Activity ignored: {} is not idle-monitored", user_id),
            Message::IdleBucketChanged(user_id, from, to) => format!("{} idle bucket {} -> {}", user_id, from, to),
            Message::ReturnedFromIdle(user_id, minutes) => format!("{} returned after a {} min break", user_id, minutes),

            // === BACKGROUND SENSOR MESSAGES ===
            Message::SensorStarted(user_id) => format!("Background sensing started for {}", user_id),
            Message::SensorStopped(user_id) => format!("Background sensing stopped for {}", user_id),
            Message::SensorUserNotMonitored(user_id) => format!("Signal ignored: {} is not sensed", user_id),
            Message::SignalRecorded(user_id, sensor, signal) => format!("{} {}: {}", user_id, sensor, signal),
            Message::BackgroundLevelChanged(user_id, from, to) => format!("{} background level {} -> {}", user_id, from, to),
            Message::ProbeSampleFailed(probe, error) => format!("Probe '{}' failed: {}", probe, error),

            // === ORCHESTRATOR MESSAGES ===
            Message::MonitoringStarted(user_id, session_id) => format!("Monitoring {} (session {})", user_id, session_id),
            Message::MonitoringSessionSwitched(user_id, session_id) => {
                format!("{} is already monitored, now tracking session {}", user_id, session_id)
            }
            Message::MonitoringStopped(user_id) => format!("Stopped monitoring {}", user_id),
            Message::UserNotMonitored(user_id) => format!("{} is not monitored", user_id),
            Message::NoAsyncRuntime(user_id) => {
                format!("No async runtime available, background loops for {} are not running", user_id)
            }
            Message::SourceQueryFailed(user_id, source) => format!("{} source failed for {}, skipping it", source, user_id),
            Message::PresenceTransition(user_id, from, to) => format!("{}: {} -> {}", user_id, from, to),
            Message::TransitionPersistFailed(user_id, error) => {
                format!("Could not persist transition for {}, will retry: {}", user_id, error)
            }
            Message::TransitionsDropped(user_id, count) => {
                format!("Dropped {} unpersisted transitions for {}", count, user_id)
            }
            Message::ObserverPanicked(user_id) => format!("A transition observer for {} panicked", user_id),
            Message::PatternLoadFailed(user_id, error) => format!("Could not load activity pattern for {}: {}", user_id, error),
            Message::PatternSaveFailed(user_id, error) => format!("Could not save activity pattern for {}: {}", user_id, error),
            Message::PatternStoreNotAttached => {
                "Pattern store not attached: orchestrator is already shared".to_string()
            }
            Message::WorkerStopped(name) => format!("Worker {} stopped", name),
            Message::WorkerJoinFailed(name, error) => format!("Worker {} did not finish cleanly: {}", name, error),
            Message::WorkerTickFailed(name, error) => format!("Worker {} tick failed: {}", name, error),

            // === WATCH MESSAGES ===
            Message::WatchStarted(user_id, session_id) => format!(
                "Watching {} (session {}). Type an interaction kind or 'status', Ctrl+C to stop",
                user_id, session_id
            ),
            Message::WatchStopping => "Stopping presence monitoring...".to_string(),
            Message::TransitionLine(time, from, to, context, confidence, sources) => format!(
                "[{}] {} -> {} ({}, confidence {:.2}, sources: {})",
                time, from, to, context, confidence, sources
            ),
            Message::InvalidInteraction(error) => format!("Interaction not recorded: {}", error),
            Message::StdinReadFailed(error) => format!("Stopped reading input: {}", error),
            Message::StatusRenderFailed(error) => format!("Could not render status: {}", error),
            Message::NextBreakPrediction(eta, probability) => {
                format!("Next break in about {:.0} min (probability {:.2})", eta, probability)
            }

            // === HISTORY MESSAGES ===
            Message::HistoryHeader(user_id) => format!("Presence transitions for {}:", user_id),
            Message::NoTransitionsFound(user_id) => format!("No transitions recorded for {}", user_id),
            Message::HistoryPruned(removed) => format!("Pruned {} old transitions", removed),
            Message::HistoryPruneFailed(error) => format!("Could not prune transition history: {}", error),
            Message::InvalidHistoryLimit => "Limit must be greater than zero".to_string(),

            // === CONFIGURATION MESSAGES ===
            Message::ConfigSaved => "Configuration saved successfully".to_string(),
            Message::ConfigDeleted => "Configuration deleted".to_string(),
            Message::ConfigModuleSession => "Session tracking".to_string(),
            Message::ConfigModuleIdle => "Idle monitoring".to_string(),
            Message::ConfigModuleFusion => "Presence fusion".to_string(),
            Message::ConfigModuleWatch => "Watch command".to_string(),

            // === PROMPT MESSAGES ===
            Message::PromptSelectModules => "Select nodes to configure".to_string(),
            Message::PromptSessionIdleAfter => "Seconds of silence before a session is idle".to_string(),
            Message::PromptSessionAwayAfter => "Seconds of silence before a session is away".to_string(),
            Message::PromptSessionEndAfter => "Seconds of silence before a session ends".to_string(),
            Message::PromptIdleReevaluateInterval => "Idle re-evaluation interval (seconds)".to_string(),
            Message::PromptIdleSessionGap => "Gap that separates activity sessions (seconds)".to_string(),
            Message::PromptFusionInterval => "Fusion interval (seconds)".to_string(),
            Message::PromptHistoryRetention => "Keep transition history for (days)".to_string(),
            Message::PromptWatchUserId => "User id to report under".to_string(),
            Message::PromptWatchSystemProbe => "Sample CPU and network activity".to_string(),

            // === MIGRATION MESSAGES ===
            Message::MigrationsFound(count) => format!("Found {} pending database migrations", count),
            Message::RunningMigration(version, name) => format!("Running migration v{}: {}", version, name),
            Message::MigrationFailed(version, error) => format!("✗ Migration v{} failed: {}", version, error),
            Message::DatabaseVersion(version) => format!("Current database version: {}", version),
            Message::DatabaseUpToDate => "Database schema is up to date".to_string(),
        };

        write!(f, "{}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_line_formatting() {
        let line = Message::TransitionLine(
            "10:00:00".to_string(),
            "ACTIVELY_PRESENT".to_string(),
            "AWAY".to_string(),
            "BREAK_TIME".to_string(),
            0.7,
            "session,idle".to_string(),
        );
        assert_eq!(
            line.to_string(),
            "[10:00:00] ACTIVELY_PRESENT -> AWAY (BREAK_TIME, confidence 0.70, sources: session,idle)"
        );
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(
            Message::NextBreakPrediction(29.6, 0.5).to_string(),
            "Next break in about 30 min (probability 0.50)"
        );
        assert_eq!(
            Message::StatusRenderFailed("broken pipe".to_string()).to_string(),
            "Could not render status: broken pipe"
        );
    }
}
