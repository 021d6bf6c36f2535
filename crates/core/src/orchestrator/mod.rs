//! Batch orchestration.
//!
//! The orchestrator drives one batch run:
//! - **Discovery**: walks the input tree once, skipping checkpointed,
//!   exhausted and backing-off units, smallest first
//! - **Chunks**: dispatched one at a time with a worker count from the
//!   adaptive scaler, halved under memory pressure
//! - **Bookkeeping**: checkpoint, retry ledger and job progress updated and
//!   persisted between chunks
//! - **Retry phase**: transiently failed units re-dispatched while their
//!   backoff expires within a bounded wait

mod config;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::{chunk_size_for, BatchOrchestrator};
pub use types::{
    BatchProgress, BatchSummary, CancelHandle, ChunkResult, OrchestratorError, ProgressCallback,
    RunOutcome,
};
