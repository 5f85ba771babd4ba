//! Error taxonomy shared by every engine component.
//!
//! "Not yet computed" is never an error: caches answer with empty or absent
//! states. Only genuine failures (unknown list references, transport faults,
//! caller misuse, exhausted polling) surface as [`EngineError`].

use serde::Serialize;
use thiserror::Error;

use crate::model::ListId;

/// Error type for all engine operations.
///
/// `Clone` so a single fetch or job failure can be handed to every waiter
/// that joined the same in-flight operation, and `Serialize` so it can be
/// projected into presenter snapshots.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EngineError {
    /// The operation referenced a list identifier the registry does not know.
    #[error("list {0} not found")]
    NotFound(ListId),

    /// The data source failed (transport error, server error, failed job).
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// The caller asked for something the current state does not allow.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Summary polling hit its attempt bound without the job finishing.
    #[error("summary job still running after {attempts} poll attempts")]
    Exhausted { attempts: u32 },
}

impl EngineError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates an `InvalidState` error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether a later `get`/`refresh`/`force_refresh` may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Exhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(EngineError::NotFound(ListId(7)).to_string(), "list 7 not found");
        assert_eq!(
            EngineError::unavailable("HTTP 502").to_string(),
            "data source unavailable: HTTP 502"
        );
        assert_eq!(
            EngineError::Exhausted { attempts: 30 }.to_string(),
            "summary job still running after 30 poll attempts"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::unavailable("reset").is_retryable());
        assert!(EngineError::Exhausted { attempts: 3 }.is_retryable());
        assert!(!EngineError::NotFound(ListId(1)).is_retryable());
        assert!(!EngineError::invalid_state("no active list").is_retryable());
    }

    #[test]
    fn serializes_with_variant_tag() {
        let json = serde_json::to_value(EngineError::NotFound(ListId(3))).unwrap();
        assert_eq!(json, serde_json::json!({"NotFound": 3}));
    }
}
