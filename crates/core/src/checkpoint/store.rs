use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persist::{self, PersistError};

/// File name of the checkpoint inside the checkpoint directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint persistence failed: {0}")]
    Persist(#[from] PersistError),
}

/// Persisted checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub processed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Checkpoint file plus its in-memory state.
///
/// Only the orchestrator task mutates it, between chunk dispatches.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: CheckpointState,
}

impl CheckpointStore {
    /// Store rooted at `dir`. Nothing is read until [`load`](Self::load).
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CHECKPOINT_FILE),
            state: CheckpointState::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint from disk, replacing the in-memory state.
    ///
    /// A missing file yields an empty state. Leftover temp files from an
    /// interrupted save are removed.
    pub fn load(&mut self) -> Result<&CheckpointState, CheckpointError> {
        let stale = persist::remove_stale_temps(&self.path);
        if stale > 0 {
            warn!(
                "Removed {} stale checkpoint temp file(s) from an interrupted save",
                stale
            );
        }

        self.state = persist::read_json(&self.path)?.unwrap_or_default();
        info!(
            path = %self.path.display(),
            processed = self.state.processed.len(),
            failed = self.state.failed.len(),
            "Loaded checkpoint"
        );
        Ok(&self.state)
    }

    /// Stamp and atomically write the current state.
    pub fn save(&mut self) -> Result<(), CheckpointError> {
        self.state.timestamp = Some(Utc::now());
        persist::write_json_atomic(&self.path, &self.state)?;
        debug!(
            processed = self.state.processed.len(),
            failed = self.state.failed.len(),
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Replace the in-memory state and write it.
    pub fn save_state(&mut self, state: CheckpointState) -> Result<(), CheckpointError> {
        self.state = state;
        self.save()
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn is_processed(&self, unit_id: &str) -> bool {
        self.state.processed.contains(unit_id)
    }

    pub fn is_failed(&self, unit_id: &str) -> bool {
        self.state.failed.contains(unit_id)
    }

    /// Record a success. Moves the unit out of the failed set.
    pub fn mark_processed(&mut self, unit_id: &str) {
        self.state.failed.remove(unit_id);
        self.state.processed.insert(unit_id.to_string());
    }

    /// Record a failure. A processed unit stays processed.
    pub fn mark_failed(&mut self, unit_id: &str) {
        if !self.state.processed.contains(unit_id) {
            self.state.failed.insert(unit_id.to_string());
        }
    }

    pub fn processed_count(&self) -> usize {
        self.state.processed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.state.failed.len()
    }
}
