use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the state directory created under the output location.
pub const STATE_DIR_NAME: &str = ".docbatch";

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub batch: BatchConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scaler: ScalerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl Config {
    /// Directory holding the checkpoint and retry ledger for this run.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.batch
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.batch.output_dir.join(STATE_DIR_NAME))
    }

    /// Path of the job registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.jobs
            .registry_path
            .clone()
            .unwrap_or_else(|| self.checkpoint_dir().join("jobs.json"))
    }
}

/// Batch run configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Directory scanned for work units.
    pub input_dir: PathBuf,
    /// Directory receiving one output file per unit.
    pub output_dir: PathBuf,
    /// Where checkpoint state lives (default: `<output_dir>/.docbatch`).
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Units per chunk before concurrency is re-evaluated.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound on concurrent workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Base per-unit engine timeout in seconds.
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_secs: u64,
    /// Hard ceiling for the size-adjusted per-unit timeout.
    #[serde(default = "default_max_unit_timeout")]
    pub max_unit_timeout_secs: u64,
    /// Input size covered by one base timeout.
    #[serde(default = "default_timeout_reference_bytes")]
    pub timeout_reference_bytes: u64,
    /// Files larger than this are skipped at discovery.
    #[serde(default = "default_max_unit_bytes")]
    pub max_unit_bytes: u64,
    /// Accepted file extensions, without the dot (empty = all files).
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Chunk failure rate (0.0-1.0) above which the run is aborted.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Memory utilisation (0.0-1.0) above which chunks are halved.
    #[serde(default = "default_memory_pressure_threshold")]
    pub memory_pressure_threshold: f64,
    /// Interval between resource health checks in seconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Longest the retry phase waits for a backoff to expire, in seconds.
    #[serde(default = "default_retry_wait_limit")]
    pub retry_wait_limit_secs: u64,
}

fn default_chunk_size() -> usize {
    100
}

fn default_max_workers() -> usize {
    8
}

fn default_unit_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_unit_timeout() -> u64 {
    3600 // 1 hour
}

fn default_timeout_reference_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_max_unit_bytes() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_memory_pressure_threshold() -> f64 {
    0.8
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_retry_wait_limit() -> u64 {
    60
}

impl BatchConfig {
    /// Create a batch config with defaults for everything but the locations.
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            checkpoint_dir: None,
            chunk_size: default_chunk_size(),
            max_workers: default_max_workers(),
            unit_timeout_secs: default_unit_timeout(),
            max_unit_timeout_secs: default_max_unit_timeout(),
            timeout_reference_bytes: default_timeout_reference_bytes(),
            max_unit_bytes: default_max_unit_bytes(),
            extensions: Vec::new(),
            failure_rate_threshold: default_failure_rate_threshold(),
            memory_pressure_threshold: default_memory_pressure_threshold(),
            health_check_interval_secs: default_health_check_interval(),
            retry_wait_limit_secs: default_retry_wait_limit(),
        }
    }
}

/// Engine instance pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Fixed pool size. When unset it is derived from memory, CPU count and
    /// the worker cap.
    #[serde(default)]
    pub max_instances: Option<usize>,
    /// Memory one engine instance is expected to hold, in GB.
    #[serde(default = "default_per_instance_memory_gb")]
    pub per_instance_memory_gb: f64,
    /// How long a worker waits for a free instance, in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    /// Interval between idle-instance health checks, in seconds.
    #[serde(default = "default_pool_health_interval")]
    pub health_check_interval_secs: u64,
}

fn default_per_instance_memory_gb() -> f64 {
    2.0
}

fn default_acquire_timeout() -> u64 {
    120
}

fn default_pool_health_interval() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: None,
            per_instance_memory_gb: default_per_instance_memory_gb(),
            acquire_timeout_secs: default_acquire_timeout(),
            health_check_interval_secs: default_pool_health_interval(),
        }
    }
}

/// Adaptive worker scaling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScalerConfig {
    /// Memory budget per worker, in GB.
    #[serde(default = "default_per_worker_memory_gb")]
    pub per_worker_memory_gb: f64,
    /// File descriptors a worker is expected to hold.
    #[serde(default = "default_per_worker_fds")]
    pub per_worker_fds: u64,
    /// CPU percentage one worker is expected to consume.
    #[serde(default = "default_cpu_per_worker_pct")]
    pub cpu_per_worker_pct: f64,
    /// Minimum time between two adjustments, in seconds.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Number of throughput samples kept for trend detection.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_per_worker_memory_gb() -> f64 {
    1.0
}

fn default_per_worker_fds() -> u64 {
    64
}

fn default_cpu_per_worker_pct() -> f64 {
    20.0
}

fn default_cooldown() -> u64 {
    60
}

fn default_history_size() -> usize {
    10
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            per_worker_memory_gb: default_per_worker_memory_gb(),
            per_worker_fds: default_per_worker_fds(),
            cpu_per_worker_pct: default_cpu_per_worker_pct(),
            cooldown_secs: default_cooldown(),
            history_size: default_history_size(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Maximum attempts per unit before it is reported as exhausted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Exponential backoff base (delay = base^attempts seconds).
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Maximum backoff delay in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    3600 // 1 hour
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

/// Job registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// Registry file (default: `<checkpoint_dir>/jobs.json`).
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    /// Job type recorded for runs started by the runner.
    #[serde(default = "default_job_type")]
    pub job_type: String,
    /// How often the reconciler checks owner processes, in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Terminal jobs older than this are swept, in hours.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Time between SIGTERM and SIGKILL when cancelling, in seconds.
    #[serde(default = "default_termination_grace")]
    pub termination_grace_secs: u64,
}

fn default_job_type() -> String {
    "parse".to_string()
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_retention_hours() -> u64 {
    24 * 7
}

fn default_termination_grace() -> u64 {
    10
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            job_type: default_job_type(),
            reconcile_interval_secs: default_reconcile_interval(),
            retention_hours: default_retention_hours(),
            termination_grace_secs: default_termination_grace(),
        }
    }
}

/// External engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Engine executable.
    pub path: PathBuf,
    /// Extra arguments passed on every launch.
    #[serde(default)]
    pub args: Vec<String>,
    /// How long a freshly launched engine has to answer its first ping.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout() -> u64 {
    60
}

impl EngineConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            [batch]
            input_dir = "/in"
            output_dir = "/out"

            [engine]
            path = "analyzer"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.batch.chunk_size, 100);
        assert_eq!(config.batch.failure_rate_threshold, 0.5);
        assert_eq!(config.batch.memory_pressure_threshold, 0.8);
        assert_eq!(config.pool.max_instances, None);
        assert_eq!(config.scaler.cooldown_secs, 60);
        assert_eq!(config.retry.backoff_base, 2.0);
        assert_eq!(config.retry.max_backoff_secs, 3600);
        assert_eq!(config.jobs.job_type, "parse");
    }

    #[test]
    fn test_derived_paths() {
        let config = minimal();
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/out/.docbatch"));
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/out/.docbatch/jobs.json")
        );
    }

    #[test]
    fn test_explicit_paths_win() {
        let mut config = minimal();
        config.batch.checkpoint_dir = Some(PathBuf::from("/state"));
        config.jobs.registry_path = Some(PathBuf::from("/var/jobs.json"));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/state"));
        assert_eq!(config.registry_path(), PathBuf::from("/var/jobs.json"));
    }
}
