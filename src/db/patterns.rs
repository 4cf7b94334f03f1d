//! Learned idle patterns, one row per user.

use crate::db::db::Db;
use crate::libs::idle::ActivityPattern;
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const SELECT_PATTERN: &str = "SELECT typical_session_minutes, session_weight, preferred_break_minutes, break_weight,
    observations, updated_at FROM activity_patterns WHERE user_id = ?1";

const UPSERT_PATTERN: &str = "INSERT INTO activity_patterns
    (user_id, typical_session_minutes, session_weight, preferred_break_minutes, break_weight, observations, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(user_id) DO UPDATE SET
        typical_session_minutes = excluded.typical_session_minutes,
        session_weight = excluded.session_weight,
        preferred_break_minutes = excluded.preferred_break_minutes,
        break_weight = excluded.break_weight,
        observations = excluded.observations,
        updated_at = excluded.updated_at";

pub trait PatternStore: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<ActivityPattern>>;
    fn save(&self, user_id: &str, pattern: &ActivityPattern) -> Result<()>;
}

pub struct Patterns {
    pub conn: Arc<Mutex<Connection>>,
}

impl Patterns {
    pub fn new() -> Result<Patterns> {
        Ok(Self::from_db(Db::new()?))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Patterns> {
        Ok(Self::from_db(Db::open(path)?))
    }

    pub fn from_db(db: Db) -> Patterns {
        Patterns {
            conn: Arc::new(Mutex::new(db.conn)),
        }
    }
}

impl PatternStore for Patterns {
    fn load(&self, user_id: &str) -> Result<Option<ActivityPattern>> {
        let conn = self.conn.lock();
        let pattern = conn
            .query_row(SELECT_PATTERN, params![user_id], |row| {
                Ok(ActivityPattern {
                    typical_session_minutes: row.get(0)?,
                    session_weight: row.get(1)?,
                    preferred_break_minutes: row.get(2)?,
                    break_weight: row.get(3)?,
                    observations: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .optional()?;
        Ok(pattern)
    }

    fn save(&self, user_id: &str, pattern: &ActivityPattern) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            UPSERT_PATTERN,
            params![
                user_id,
                pattern.typical_session_minutes,
                pattern.session_weight,
                pattern.preferred_break_minutes,
                pattern.break_weight,
                pattern.observations,
                pattern.updated_at,
            ],
        )?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPatterns {
    patterns: Mutex<HashMap<String, ActivityPattern>>,
}

impl MemoryPatterns {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternStore for MemoryPatterns {
    fn load(&self, user_id: &str) -> Result<Option<ActivityPattern>> {
        Ok(self.patterns.lock().get(user_id).cloned())
    }

    fn save(&self, user_id: &str, pattern: &ActivityPattern) -> Result<()> {
        self.patterns.lock().insert(user_id.to_string(), pattern.clone());
        Ok(())
    }
}
