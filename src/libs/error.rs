//! Error types raised at the public call boundary.
//!
//! Only *invalid input* is reported as an error. Missing or stale detector
//! sources lower fusion confidence instead, and storage failures are handled
//! with `anyhow` inside the persistence layer and retried by the orchestrator.

use thiserror::Error;

/// Rejections produced before any per-user state is touched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PresenceError {
    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),

    #[error("unknown interaction kind '{0}'")]
    UnknownInteractionKind(String),

    #[error("unknown activity kind '{0}'")]
    UnknownActivityKind(String),

    #[error("unknown sensor kind '{0}'")]
    UnknownSensorKind(String),

    #[error("unknown signal '{0}'")]
    UnknownSignal(String),

    #[error("intensity {0} is outside [0, 1]")]
    InvalidIntensity(f64),

    #[error("signal value {0} is outside [0, 1]")]
    InvalidSignalValue(f64),

    #[error("event metadata must be a JSON object")]
    InvalidMetadata,

    #[error("probe '{probe}' failed: {reason}")]
    ProbeFailed { probe: String, reason: String },

    #[error("monitoring for '{0}' is still stopping")]
    StopInProgress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Validates a user or session identifier.
pub fn require_id(value: &str, what: &'static str) -> Result<(), PresenceError> {
    if value.trim().is_empty() {
        return Err(PresenceError::EmptyIdentifier(what));
    }
    Ok(())
}

/// Validates optional event metadata: absent, null or a JSON object.
pub fn require_metadata(metadata: Option<&serde_json::Value>) -> Result<(), PresenceError> {
    match metadata {
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::Object(_)) => Ok(()),
        Some(_) => Err(PresenceError::InvalidMetadata),
    }
}

/// Validates a unit-interval value such as an intensity or signal level.
pub fn require_unit(value: f64, err: fn(f64) -> PresenceError) -> Result<f64, PresenceError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(err(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_unit_rejects_out_of_range() {
        assert_eq!(require_unit(0.5, PresenceError::InvalidIntensity), Ok(0.5));
        assert!(require_unit(1.5, PresenceError::InvalidIntensity).is_err());
        assert!(require_unit(f64::NAN, PresenceError::InvalidSignalValue).is_err());
    }

    #[test]
    fn test_require_metadata_accepts_objects_only() {
        assert!(require_metadata(None).is_ok());
        assert!(require_metadata(Some(&serde_json::json!({"page": "home"}))).is_ok());
        assert_eq!(require_metadata(Some(&serde_json::json!([1, 2]))), Err(PresenceError::InvalidMetadata));
    }

    #[test]
    fn test_require_id_rejects_blank() {
        assert_eq!(require_id("  ", "user id"), Err(PresenceError::EmptyIdentifier("user id")));
        assert!(require_id("alice", "user id").is_ok());
    }
}
