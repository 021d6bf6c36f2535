//! Job lifecycle tracking that outlives any single process.
//!
//! Jobs live in a JSON registry file. The owning orchestrator updates
//! progress; a background reconciler fails jobs whose owner died and sweeps
//! old terminal jobs.

mod process;
mod reconciler;
mod registry;
mod types;

pub use process::{is_process_alive, terminate_process};
pub use reconciler::{JobReconciler, ReconcileReport};
pub use registry::JobRegistry;
pub use types::{Job, JobError, JobFilter, JobProgress, JobStatus, ProgressDelta};
