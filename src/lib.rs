//! presenced: real-time presence fusion.
//!
//! Three independent detectors (session interaction cadence, idle duration and
//! ambient background signals) are fused by the
//! [`PresenceOrchestrator`](libs::orchestrator::PresenceOrchestrator) into one
//! confidence-scored presence record per user.

pub mod commands;
pub mod db;
pub mod libs;
