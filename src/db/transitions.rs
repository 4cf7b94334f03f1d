//! Append-only storage for presence transitions.
//!
//! The orchestrator writes through the [`TransitionStore`] trait, so the
//! SQLite-backed [`Transitions`] can be swapped for [`MemoryTransitions`] (or a
//! deliberately failing store) in tests.

use crate::db::db::Db;
use crate::libs::presence::{sources_from_string, sources_to_string, TransitionRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const INSERT_TRANSITION: &str = "INSERT INTO transitions
    (user_id, from_state, to_state, context, confidence, availability, attention, receptivity,
     duration_secs, contributing_sources, metadata, timestamp)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const SELECT_USER_HISTORY: &str = "SELECT * FROM (
        SELECT id, user_id, from_state, to_state, context, confidence, availability, attention, receptivity,
               duration_secs, contributing_sources, metadata, timestamp
        FROM transitions WHERE user_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2
    ) ORDER BY timestamp ASC, id ASC";

const DELETE_OLDER_THAN: &str = "DELETE FROM transitions WHERE timestamp < ?1";

/// Durable, append-only log of [`TransitionRecord`]s.
///
/// Implementations must be safe for concurrent appends from several users'
/// fusion loops.
pub trait TransitionStore: Send + Sync {
    /// Persists one record and returns its id.
    fn append(&self, record: &TransitionRecord) -> Result<i64>;

    /// The most recent `limit` records for a user, oldest first.
    fn history(&self, user_id: &str, limit: usize) -> Result<Vec<TransitionRecord>>;

    /// Drops records older than `cutoff`, returning how many were removed.
    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub struct Transitions {
    pub conn: Arc<Mutex<Connection>>,
}

impl Transitions {
    pub fn new() -> Result<Transitions> {
        Ok(Self::from_db(Db::new()?))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Transitions> {
        Ok(Self::from_db(Db::open(path)?))
    }

    pub fn from_db(db: Db) -> Transitions {
        Transitions {
            conn: Arc::new(Mutex::new(db.conn)),
        }
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn map_transition(row: &Row) -> rusqlite::Result<TransitionRecord> {
    let sources: String = row.get(10)?;
    let metadata: Option<String> = row.get(11)?;
    Ok(TransitionRecord {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        from_state: parse_column(row, 2)?,
        to_state: parse_column(row, 3)?,
        context: parse_column(row, 4)?,
        confidence: row.get(5)?,
        availability: row.get(6)?,
        attention: row.get(7)?,
        receptivity: row.get(8)?,
        duration_secs: row.get(9)?,
        contributing_sources: sources_from_string(&sources),
        metadata: metadata
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null),
        timestamp: row.get(12)?,
    })
}

impl TransitionStore for Transitions {
    fn append(&self, record: &TransitionRecord) -> Result<i64> {
        let metadata = match &record.metadata {
            serde_json::Value::Null => None,
            value => Some(serde_json::to_string(value)?),
        };
        let conn = self.conn.lock();
        conn.execute(
            INSERT_TRANSITION,
            params![
                record.user_id,
                record.from_state.as_str(),
                record.to_state.as_str(),
                record.context.as_str(),
                record.confidence,
                record.availability,
                record.attention,
                record.receptivity,
                record.duration_secs,
                sources_to_string(&record.contributing_sources),
                metadata,
                record.timestamp,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn history(&self, user_id: &str, limit: usize) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(SELECT_USER_HISTORY)?;
        let records = stmt
            .query_map(params![user_id, limit as i64], map_transition)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(DELETE_OLDER_THAN, params![cutoff])?)
    }
}

/// In-process store, handy for embedding and tests.
///
/// Ids keep increasing across prunes, like SQLite row ids.
#[derive(Default)]
pub struct MemoryTransitions {
    records: Mutex<Vec<TransitionRecord>>,
    last_id: AtomicI64,
}

impl MemoryTransitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record for every user, in append order.
    pub fn all(&self) -> Vec<TransitionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TransitionStore for MemoryTransitions {
    fn append(&self, record: &TransitionRecord) -> Result<i64> {
        let mut records = self.records.lock();
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        records.push(stored);
        Ok(id)
    }

    fn history(&self, user_id: &str, limit: usize) -> Result<Vec<TransitionRecord>> {
        let records = self.records.lock();
        let mine: Vec<TransitionRecord> = records.iter().filter(|record| record.user_id == user_id).cloned().collect();
        let skip = mine.len().saturating_sub(limit);
        Ok(mine.into_iter().skip(skip).collect())
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|record| record.timestamp >= cutoff);
        Ok(before - records.len())
    }
}
