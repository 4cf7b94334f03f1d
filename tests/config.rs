#[cfg(test)]
mod tests {
    use presenced::db::transitions::{TransitionStore, Transitions};
    use presenced::libs::config::{Config, PresenceConfig, WatchConfig, CONFIG_FILE_NAME};
    use presenced::libs::data_storage::DataStorage;
    use presenced::libs::error::PresenceError;
    use std::fs;
    use std::sync::{Mutex, MutexGuard};
    use tempfile::TempDir;
    use test_context::{test_context, TestContext};

    /// Tests below repoint HOME, which is process-wide.
    static HOME_LOCK: Mutex<()> = Mutex::new(());

    struct ConfigTestContext {
        _temp_dir: TempDir,
        _guard: MutexGuard<'static, ()>,
    }

    impl TestContext for ConfigTestContext {
        fn setup() -> Self {
            let guard = HOME_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let temp_dir = tempfile::tempdir().unwrap();
            std::env::set_var("HOME", temp_dir.path());
            std::env::set_var("LOCALAPPDATA", temp_dir.path());

            ConfigTestContext {
                _temp_dir: temp_dir,
                _guard: guard,
            }
        }
    }

    #[test_context(ConfigTestContext)]
    #[test]
    fn test_missing_file_yields_defaults(_ctx: &mut ConfigTestContext) {
        let config = Config::read().unwrap();
        assert!(config.presence.is_none());
        assert_eq!(config.presence_or_default(), PresenceConfig::default());
        assert_eq!(config.presence_or_default().fusion.interval_secs, 15);
    }

    #[test_context(ConfigTestContext)]
    #[test]
    fn test_saved_config_reads_back(_ctx: &mut ConfigTestContext) {
        let mut presence = PresenceConfig::default();
        presence.session.idle_after_secs = 90;
        presence.fusion.history_retention_days = 7;
        let config = Config {
            presence: Some(presence.clone()),
            watch: Some(WatchConfig {
                user_id: "alice".to_string(),
                system_probe: false,
            }),
        };
        config.save().unwrap();

        let read = Config::read().unwrap();
        assert_eq!(read.presence, Some(presence));
        assert_eq!(read.watch_or_default().user_id, "alice");
        assert!(!read.watch_or_default().system_probe);

        Config::delete().unwrap();
        assert!(Config::read().unwrap().presence.is_none());
    }

    #[test_context(ConfigTestContext)]
    #[test]
    fn test_partial_file_fills_in_defaults(_ctx: &mut ConfigTestContext) {
        let path = DataStorage::new().get_path(CONFIG_FILE_NAME).unwrap();
        fs::write(&path, r#"{"presence": {"fusion": {"interval_secs": 5}, "idle": {"session_gap_secs": 600}}}"#).unwrap();

        let presence = Config::read().unwrap().presence_or_default();
        assert_eq!(presence.fusion.interval_secs, 5);
        assert_eq!(presence.fusion.background_stale_secs, 600);
        assert_eq!(presence.idle.session_gap_secs, 600);
        assert_eq!(presence.idle.short_idle_after_secs, 60);
        assert_eq!(presence.session, Default::default());
    }

    #[test_context(ConfigTestContext)]
    #[test]
    fn test_malformed_file_is_an_error(_ctx: &mut ConfigTestContext) {
        let path = DataStorage::new().get_path(CONFIG_FILE_NAME).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::read().is_err());
    }

    #[test_context(ConfigTestContext)]
    #[test]
    fn test_broken_tunables_are_rejected(_ctx: &mut ConfigTestContext) {
        let path = DataStorage::new().get_path(CONFIG_FILE_NAME).unwrap();
        let broken = [
            r#"{"presence": {"sensor": {"stale_decay": 1.0}}}"#,
            r#"{"presence": {"idle": {"medium_idle_after_secs": 2000}}}"#,
            r#"{"presence": {"session": {"away_after_secs": 30}}}"#,
            r#"{"presence": {"fusion": {"session_weight": 0.0, "idle_weight": 0.0, "background_weight": 0.0}}}"#,
        ];
        for contents in broken {
            fs::write(&path, contents).unwrap();
            let err = Config::read().unwrap_err();
            assert!(err.to_string().starts_with("invalid configuration"), "{contents}: {err}");
        }

        fs::write(&path, r#"{"presence": {"fusion": {"background_weight": 0.0}}}"#).unwrap();
        assert_eq!(Config::read().unwrap().presence_or_default().fusion.background_weight, 0.0);
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(PresenceConfig::default().validate().is_ok());

        let mut presence = PresenceConfig::default();
        presence.idle.pattern_decay_per_week = 1.0;
        assert!(matches!(presence.validate(), Err(PresenceError::InvalidConfig(_))));
    }

    #[test_context(ConfigTestContext)]
    #[test]
    fn test_default_database_lives_in_data_dir(_ctx: &mut ConfigTestContext) {
        let store = Transitions::new().unwrap();
        assert!(store.history("alice", 5).unwrap().is_empty());
        assert!(DataStorage::new().get_path("presenced.db").unwrap().exists());
    }
}
