//! Types for the batch orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::checkpoint::CheckpointError;
use crate::discovery::DiscoveryStats;
use crate::job::JobError;
use crate::retry::RetryStats;

/// Errors that end a run before or outside normal unit processing.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Checkpoint or retry ledger could not be read or written.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Job registry error.
    #[error("job registry error: {0}")]
    Job(#[from] JobError),

    /// The input directory could not be read.
    #[error("cannot read input directory {path}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No engine instance could be started.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every queued unit was attempted.
    Completed,
    /// A chunk exceeded the failure-rate threshold.
    Aborted { reason: String },
    /// The run finished but too large a share of units failed.
    TooManyFailures { failed: usize, total: usize },
    /// Stopped on request.
    Cancelled,
}

impl RunOutcome {
    /// Error recorded on the job, if the outcome counts as a failure.
    pub fn job_error(&self) -> Option<String> {
        match self {
            RunOutcome::Completed | RunOutcome::Cancelled => None,
            RunOutcome::Aborted { reason } => Some(format!("aborted: {}", reason)),
            RunOutcome::TooManyFailures { failed, total } => Some(format!(
                "intolerable failure rate: {} of {} units failed",
                failed, total
            )),
        }
    }
}

/// Folded results of one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkResult {
    pub processed: usize,
    pub failed: usize,
    /// Units not attempted because no engine instance was free.
    pub deferred: usize,
    pub chunk_size: usize,
}

impl ChunkResult {
    /// Failed share of the chunk, 0.0-1.0.
    pub fn failure_rate(&self) -> f64 {
        if self.chunk_size == 0 {
            return 0.0;
        }
        self.failed as f64 / self.chunk_size as f64
    }
}

/// Progress reported to the callback after every chunk.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub deferred: usize,
    pub chunks: usize,
    pub workers: usize,
    pub last_chunk: ChunkResult,
    /// Share of `total` attempted either way, 0-100.
    pub percentage: f64,
}

/// Called by the orchestrator after each chunk.
pub type ProgressCallback = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub job_id: Option<String>,
    /// Units queued by discovery.
    pub total: usize,
    pub successful: usize,
    /// Units whose last attempt in this run failed.
    pub failed: usize,
    /// Units never attempted because the pool stayed exhausted.
    pub deferred: usize,
    /// Files seen by discovery but not queued.
    pub skipped: usize,
    pub duration_secs: f64,
    /// Successful units per second.
    pub throughput: f64,
    pub outcome: RunOutcome,
    pub discovery: DiscoveryStats,
    pub retry: RetryStats,
}

/// Requests cancellation of a running batch from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new(tx: Arc<watch::Sender<bool>>) -> Self {
        Self { tx }
    }

    /// Stop submitting new units. In-flight units finish or time out.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_failure_rate() {
        let chunk = ChunkResult {
            processed: 2,
            failed: 3,
            deferred: 0,
            chunk_size: 5,
        };
        assert_eq!(chunk.failure_rate(), 0.6);
        assert_eq!(ChunkResult::default().failure_rate(), 0.0);
    }

    #[test]
    fn test_outcome_job_error() {
        assert!(RunOutcome::Completed.job_error().is_none());
        assert!(RunOutcome::Cancelled.job_error().is_none());
        assert_eq!(
            RunOutcome::TooManyFailures { failed: 6, total: 10 }
                .job_error()
                .unwrap(),
            "intolerable failure rate: 6 of 10 units failed"
        );
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::EngineUnavailable("spawn failed".to_string());
        assert_eq!(err.to_string(), "engine unavailable: spawn failed");
    }

    #[test]
    fn test_cancel_handle() {
        let (tx, _rx) = watch::channel(false);
        let handle = CancelHandle::new(Arc::new(tx));
        assert!(!handle.is_cancelled());
        handle.clone().cancel();
        assert!(handle.is_cancelled());
    }
}
