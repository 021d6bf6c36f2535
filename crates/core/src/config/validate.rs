use super::{types::Config, ConfigError};
use crate::retry::MAX_BACKOFF_SECS;

/// Validate configuration
/// Currently validates:
/// - Chunk size and worker cap are non-zero
/// - Ratios are within (0, 1]
/// - Backoff base is at least 1 (keeps backoff deadlines monotonic)
/// - Backoff cap is at most 30 days
/// - Scaler cooldown is at least a minute
/// - Retry attempts and engine path are set
const MIN_SCALER_COOLDOWN_SECS: u64 = 60;

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let batch = &config.batch;

    if batch.chunk_size == 0 {
        return Err(invalid("batch.chunk_size cannot be 0"));
    }
    if batch.max_workers == 0 {
        return Err(invalid("batch.max_workers cannot be 0"));
    }
    if batch.unit_timeout_secs == 0 {
        return Err(invalid("batch.unit_timeout_secs cannot be 0"));
    }
    if batch.max_unit_timeout_secs < batch.unit_timeout_secs {
        return Err(invalid(
            "batch.max_unit_timeout_secs must be >= batch.unit_timeout_secs",
        ));
    }
    if !(batch.failure_rate_threshold > 0.0 && batch.failure_rate_threshold <= 1.0) {
        return Err(invalid("batch.failure_rate_threshold must be in (0, 1]"));
    }
    if !(batch.memory_pressure_threshold > 0.0 && batch.memory_pressure_threshold <= 1.0) {
        return Err(invalid("batch.memory_pressure_threshold must be in (0, 1]"));
    }
    if batch.input_dir.as_os_str().is_empty() {
        return Err(invalid("batch.input_dir cannot be empty"));
    }

    if config.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts cannot be 0"));
    }
    if config.retry.backoff_base < 1.0 {
        return Err(invalid("retry.backoff_base must be >= 1.0"));
    }
    if config.retry.max_backoff_secs > MAX_BACKOFF_SECS {
        return Err(invalid("retry.max_backoff_secs must be <= 2592000 (30 days)"));
    }

    if config.pool.max_instances == Some(0) {
        return Err(invalid("pool.max_instances cannot be 0"));
    }
    if config.pool.per_instance_memory_gb <= 0.0 {
        return Err(invalid("pool.per_instance_memory_gb must be positive"));
    }
    if config.scaler.per_worker_memory_gb <= 0.0 || config.scaler.cpu_per_worker_pct <= 0.0 {
        return Err(invalid("scaler per-worker budgets must be positive"));
    }
    if config.scaler.per_worker_fds == 0 {
        return Err(invalid("scaler.per_worker_fds cannot be 0"));
    }
    if config.scaler.cooldown_secs < MIN_SCALER_COOLDOWN_SECS {
        return Err(invalid("scaler.cooldown_secs must be >= 60"));
    }

    if config.engine.path.as_os_str().is_empty() {
        return Err(invalid("engine.path cannot be empty"));
    }

    Ok(())
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BatchConfig, EngineConfig, JobsConfig, PoolConfig, RetryConfig, ScalerConfig,
    };

    fn valid_config() -> Config {
        Config {
            batch: BatchConfig::new("/in", "/out"),
            engine: EngineConfig::new("analyzer"),
            pool: PoolConfig::default(),
            scaler: ScalerConfig::default(),
            retry: RetryConfig::default(),
            jobs: JobsConfig::default(),
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_chunk_size_zero_fails() {
        let mut config = valid_config();
        config.batch.chunk_size = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_threshold_out_of_range() {
        let mut config = valid_config();
        config.batch.failure_rate_threshold = 1.5;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.batch.memory_pressure_threshold = 0.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_backoff_base_below_one() {
        let mut config = valid_config();
        config.retry.backoff_base = 0.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("backoff_base"));
    }

    #[test]
    fn test_validate_backoff_cap_too_large() {
        let mut config = valid_config();
        config.retry.max_backoff_secs = u64::MAX;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_backoff_secs"));

        config.retry.max_backoff_secs = MAX_BACKOFF_SECS;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_short_scaler_cooldown() {
        let mut config = valid_config();
        config.scaler.cooldown_secs = 5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("cooldown_secs"));

        config.scaler.cooldown_secs = 60;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_empty_engine_path() {
        let mut config = valid_config();
        config.engine.path = "".into();
        assert!(validate_config(&config).is_err());
    }
}
