//! Persistence layer for presenced.
//!
//! SQLite storage for everything that must outlive a monitoring run: the
//! append-only transition history and learned idle patterns. The schema is
//! versioned through [`migrations`] and brought up to date whenever a
//! connection is opened.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use presenced::db::transitions::{TransitionStore, Transitions};
//!
//! let transitions = Transitions::new()?;
//! for record in transitions.history("alice", 20)? {
//!     println!("{} -> {}", record.from_state, record.to_state);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

/// Connection management.
pub mod db;

/// Versioned schema changes.
pub mod migrations;

/// Learned per-user activity patterns.
pub mod patterns;

/// Presence transition history.
pub mod transitions;
