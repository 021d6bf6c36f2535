//! Types for the processor module.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Classification of a unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitErrorKind {
    /// Engine or I/O trouble; worth retrying.
    Transient,
    /// The document itself is unusable; retrying will not help.
    Content,
    /// No engine instance was free in time. The unit was never attempted.
    ResourceExhaustion,
}

/// Classified unit failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
    pub kind: UnitErrorKind,
    pub message: String,
}

impl UnitError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: UnitErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn content(message: impl Into<String>) -> Self {
        Self {
            kind: UnitErrorKind::Content,
            message: message.into(),
        }
    }

    pub fn resource_exhaustion(message: impl Into<String>) -> Self {
        Self {
            kind: UnitErrorKind::ResourceExhaustion,
            message: message.into(),
        }
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UnitError {}

/// Result of processing one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Completed { elapsed: Duration, records: usize },
    TimedOut { elapsed: Duration, limit: Duration },
    Failed { elapsed: Duration, error: UnitError },
}

impl UnitOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            UnitOutcome::Completed { elapsed, .. }
            | UnitOutcome::TimedOut { elapsed, .. }
            | UnitOutcome::Failed { elapsed, .. } => *elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Completed { .. })
    }

    /// The unit never reached the engine because the pool was exhausted.
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            UnitOutcome::Failed {
                error: UnitError {
                    kind: UnitErrorKind::ResourceExhaustion,
                    ..
                },
                ..
            }
        )
    }

    /// A failure that retrying cannot fix.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(
            self,
            UnitOutcome::Failed {
                error: UnitError {
                    kind: UnitErrorKind::Content,
                    ..
                },
                ..
            }
        )
    }

    /// Human readable failure, if any.
    pub fn error_message(&self) -> Option<String> {
        match self {
            UnitOutcome::Completed { .. } => None,
            UnitOutcome::TimedOut { limit, .. } => {
                Some(format!("timed out after {:.1}s", limit.as_secs_f64()))
            }
            UnitOutcome::Failed { error, .. } => Some(error.message.clone()),
        }
    }

    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Completed { .. } => "completed",
            UnitOutcome::TimedOut { .. } => "timed_out",
            _ if self.is_deferred() => "deferred",
            UnitOutcome::Failed { .. } => "failed",
        }
    }
}
