pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod persist;
pub mod pool;
pub mod processor;
pub mod resources;
pub mod retry;
pub mod scaler;
pub mod testing;

pub use checkpoint::{CheckpointError, CheckpointState, CheckpointStore};
pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use discovery::{discover_units, DiscoveryOptions, DiscoveryStats, UnitQueue, WorkUnit};
pub use engine::{EngineClient, EngineError, EngineFactory, ProcessEngineFactory, Record};
pub use job::{Job, JobError, JobFilter, JobReconciler, JobRegistry, JobStatus};
pub use orchestrator::{
    BatchOrchestrator, BatchProgress, BatchSummary, CancelHandle, OrchestratorConfig,
    OrchestratorError, RunOutcome,
};
pub use pool::{default_max_instances, InstancePool, PoolError};
pub use processor::{ProcessorConfig, UnitOutcome, UnitProcessor};
pub use resources::{ResourceSampler, ResourceSnapshot, SystemSampler};
pub use retry::{RetryLedger, RetryStats};
pub use scaler::AdaptiveScaler;
