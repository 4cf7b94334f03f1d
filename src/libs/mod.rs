//! Core library modules.
//!
//! ## Layout
//!
//! - **Detectors**: [`session`], [`idle`] and [`background`] each own the
//!   per-user or per-session state for one kind of evidence
//! - **Fusion**: [`fusion`] turns detector snapshots into a presence outcome;
//!   [`orchestrator`] runs the loops, tracks transitions and notifies observers
//! - **Infrastructure**: configuration, clock, data directory, errors,
//!   messages, periodic workers and system probes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use presenced::db::transitions::MemoryTransitions;
//! use presenced::libs::clock::SystemClock;
//! use presenced::libs::config::PresenceConfig;
//! use presenced::libs::orchestrator::PresenceOrchestrator;
//! use presenced::libs::session::InteractionKind;
//! use std::sync::Arc;
//!
//! let orchestrator = PresenceOrchestrator::new(
//!     PresenceConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(MemoryTransitions::new()),
//! );
//! orchestrator.start_monitoring("alice", "web-1")?;
//! orchestrator.record_interaction("alice", InteractionKind::Message, None)?;
//! let presence = orchestrator.run_cycle("alice");
//! # Ok::<(), presenced::libs::error::PresenceError>(())
//! ```

pub mod background;
pub mod clock;
pub mod config;
pub mod data_storage;
pub mod error;
pub mod fusion;
pub mod idle;
pub mod messages;
pub mod orchestrator;
pub mod presence;
pub mod probe;
pub mod session;
pub mod view;
pub mod worker;
