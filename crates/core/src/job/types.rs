use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::PersistError;

/// Errors from job registry operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} job {job_id}: current status is {status}")]
    InvalidTransition {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Registry persistence failed: {0}")]
    Persist(#[from] PersistError),
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if the job has an owner that may be working on it.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
    /// Share of `total` that is done either way, 0-100.
    pub percentage: f64,
}

impl JobProgress {
    pub(crate) fn recompute(&mut self) {
        self.percentage = if self.total == 0 {
            0.0
        } else {
            ((self.processed + self.failed) as f64 / self.total as f64 * 100.0).min(100.0)
        };
    }
}

/// Change applied by [`JobRegistry::update_progress`](super::JobRegistry::update_progress).
///
/// Negative values occur when a unit that failed earlier in the run succeeds
/// on retry. Counters saturate at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub processed: i64,
    pub failed: i64,
}

impl ProgressDelta {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }
}

/// A tracked batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub input_location: String,
    pub output_location: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Job {
    pub(crate) fn invalid(&self, operation: &'static str) -> JobError {
        JobError::InvalidTransition {
            job_id: self.job_id.clone(),
            status: self.status,
            operation,
        }
    }

    /// Move to a terminal status, stamping `end_time` once.
    pub(crate) fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Filter by job type.
    pub job_type: Option<String>,
    /// Maximum number of results.
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 100,
        }
    }

    /// Filter by status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by job type.
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Set the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self
                .job_type
                .as_deref()
                .is_none_or(|t| t == job.job_type)
    }
}
