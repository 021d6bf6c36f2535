//! Error types for the engine module.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while talking to the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine executable could not be launched.
    #[error("failed to start engine {path}: {reason}")]
    SpawnFailed { path: PathBuf, reason: String },

    /// Engine stopped answering or its pipe closed.
    #[error("engine connection lost: {0}")]
    Connection(String),

    /// Engine process exited.
    #[error("engine process crashed: {0}")]
    Crashed(String),

    /// Engine answered with something that does not follow the protocol.
    #[error("engine protocol error: {0}")]
    Protocol(String),

    /// Engine answered but reported an internal failure for this input.
    #[error("engine reported error: {0}")]
    Reported(String),

    /// Call did not finish in time.
    #[error("engine call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The engine rejected the input itself (empty, malformed, unsupported).
    #[error("invalid input {unit_id}: {reason}")]
    InvalidInput { unit_id: String, reason: String },

    /// I/O error while talking to the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a new protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Creates a new invalid input error.
    pub fn invalid_input(unit_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            unit_id: unit_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same input could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidInput { .. })
    }

    /// Whether the client that produced this error can no longer be trusted.
    pub fn poisons_client(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Crashed(_)
                | Self::Protocol(_)
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EngineError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(EngineError::Connection("eof".into()).poisons_client());

        let content = EngineError::invalid_input("a.txt", "empty document");
        assert!(!content.is_retryable());
        assert!(!content.poisons_client());
        assert_eq!(content.to_string(), "invalid input a.txt: empty document");
    }
}
