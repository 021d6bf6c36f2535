//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, RetryConfig};
use crate::discovery::DiscoveryOptions;

/// Runtime settings of a [`BatchOrchestrator`](super::BatchOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory scanned for work units.
    pub input_dir: PathBuf,
    /// Directory holding the checkpoint and retry ledger.
    pub checkpoint_dir: PathBuf,
    /// Units per chunk before concurrency is re-evaluated.
    pub chunk_size: usize,
    /// Upper bound on concurrent workers.
    pub max_workers: usize,
    /// Chunk failure rate above which the run aborts.
    pub failure_rate_threshold: f64,
    /// Memory utilisation above which the next chunk is halved.
    pub memory_pressure_threshold: f64,
    /// Interval between resource health log lines.
    pub health_check_interval: Duration,
    /// Interval between pool health checks.
    pub pool_health_check_interval: Duration,
    /// Longest the retry phase waits for a backoff to expire.
    pub retry_wait_limit: Duration,
    /// How long warm-up waits for the first engine instance.
    pub warm_up_timeout: Duration,
    pub retry: RetryConfig,
    pub discovery: DiscoveryOptions,
}

impl OrchestratorConfig {
    pub fn new(input_dir: impl Into<PathBuf>, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            checkpoint_dir: checkpoint_dir.into(),
            chunk_size: 100,
            max_workers: 8,
            failure_rate_threshold: 0.5,
            memory_pressure_threshold: 0.8,
            health_check_interval: Duration::from_secs(30),
            pool_health_check_interval: Duration::from_secs(60),
            retry_wait_limit: Duration::from_secs(60),
            warm_up_timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
            discovery: DiscoveryOptions::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let batch = &config.batch;
        Self {
            input_dir: batch.input_dir.clone(),
            checkpoint_dir: config.checkpoint_dir(),
            chunk_size: batch.chunk_size,
            max_workers: batch.max_workers,
            failure_rate_threshold: batch.failure_rate_threshold,
            memory_pressure_threshold: batch.memory_pressure_threshold,
            health_check_interval: Duration::from_secs(batch.health_check_interval_secs),
            pool_health_check_interval: Duration::from_secs(config.pool.health_check_interval_secs),
            retry_wait_limit: Duration::from_secs(batch.retry_wait_limit_secs),
            warm_up_timeout: Duration::from_secs(
                config.pool.acquire_timeout_secs.max(config.engine.startup_timeout_secs),
            ),
            retry: config.retry.clone(),
            discovery: DiscoveryOptions {
                max_unit_bytes: batch.max_unit_bytes,
                extensions: batch.extensions.clone(),
            },
        }
    }
}
