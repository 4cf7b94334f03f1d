//! Every user-facing or logged message in presenced.
//!
//! Text lives in [`display`](super::display); call sites only pick a variant
//! and supply its parameters.

#[derive(Debug, Clone)]
pub enum Message {
    // === SESSION MESSAGES ===
    SessionStarted(String, String),    // session id, user id
    SessionNotFound(String),           // session id
    SessionExpired(String),            // session id
    SessionEnded(String, usize, u64),  // session id, interactions, duration secs
    InteractionRecorded(String, String), // session id, kind

    // === IDLE MONITOR MESSAGES ===
    IdleMonitorStarted(String),   // user id
    IdleMonitorStopped(String),   // user id
    IdleUserNotMonitored(String), // user id
    IdleBucketChanged(String, String, String), // user id, from, to
    ReturnedFromIdle(String, u64), // user id, break minutes

    // === BACKGROUND SENSOR MESSAGES ===
    SensorStarted(String),          // user id
    SensorStopped(String),          // user id
    SensorUserNotMonitored(String), // user id
    SignalRecorded(String, String, String), // user id, sensor, signal
    BackgroundLevelChanged(String, String, String), // user id, from, to
    ProbeSampleFailed(String, String), // probe, error

    // === ORCHESTRATOR MESSAGES ===
    MonitoringStarted(String, String),        // user id, session id
    MonitoringSessionSwitched(String, String), // user id, session id
    MonitoringStopped(String),                // user id
    UserNotMonitored(String),                 // user id
    NoAsyncRuntime(String),                   // user id
    SourceQueryFailed(String, String),        // user id, source
    PresenceTransition(String, String, String), // user id, from, to
    TransitionPersistFailed(String, String),  // user id, error
    TransitionsDropped(String, usize),        // user id, count
    ObserverPanicked(String),                 // user id
    PatternLoadFailed(String, String),        // user id, error
    PatternSaveFailed(String, String),        // user id, error
    PatternStoreNotAttached,
    WorkerStopped(String),            // worker name
    WorkerJoinFailed(String, String), // worker name, error
    WorkerTickFailed(String, String), // worker name, error

    // === WATCH MESSAGES ===
    WatchStarted(String, String), // user id, session id
    WatchStopping,
    TransitionLine(String, String, String, String, f64, String), // time, from, to, context, confidence, sources
    InvalidInteraction(String), // error
    StdinReadFailed(String),    // error
    StatusRenderFailed(String), // error
    NextBreakPrediction(f64, f64), // eta minutes, probability

    // === HISTORY MESSAGES ===
    HistoryHeader(String),      // user id
    NoTransitionsFound(String), // user id
    HistoryPruned(usize),       // removed
    HistoryPruneFailed(String), // error
    InvalidHistoryLimit,

    // === CONFIGURATION MESSAGES ===
    ConfigSaved,
    ConfigDeleted,
    ConfigModuleSession,
    ConfigModuleIdle,
    ConfigModuleFusion,
    ConfigModuleWatch,

    // === PROMPT MESSAGES ===
    PromptSelectModules,
    PromptSessionIdleAfter,
    PromptSessionAwayAfter,
    PromptSessionEndAfter,
    PromptIdleReevaluateInterval,
    PromptIdleSessionGap,
    PromptFusionInterval,
    PromptHistoryRetention,
    PromptWatchUserId,
    PromptWatchSystemProbe,

    // === MIGRATION MESSAGES ===
    MigrationsFound(usize),        // count
    RunningMigration(u32, String), // version, name
    MigrationFailed(u32, String),  // version, error
    DatabaseVersion(u32),
    DatabaseUpToDate,
}
