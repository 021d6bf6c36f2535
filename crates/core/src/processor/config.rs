//! Configuration for the unit processor.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

/// Default number of recent durations considered for timeout inflation.
const DEFAULT_TIMING_WINDOW: usize = 20;

/// Runtime settings of a [`UnitProcessor`](super::UnitProcessor).
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Directory receiving one output file per unit.
    pub output_dir: PathBuf,
    /// Timeout for a unit of zero bytes.
    pub base_timeout: Duration,
    /// Ceiling for the size-adjusted and inflated timeout.
    pub max_timeout: Duration,
    /// Each multiple of this size adds one base timeout.
    pub timeout_reference_bytes: u64,
    /// How long to wait for a pool lease before deferring the unit.
    pub acquire_timeout: Duration,
    /// Number of recent unit durations kept for timeout inflation.
    pub timing_window: usize,
}

impl ProcessorConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            base_timeout: Duration::from_secs(300),
            max_timeout: Duration::from_secs(3600),
            timeout_reference_bytes: 1024 * 1024,
            acquire_timeout: Duration::from_secs(120),
            timing_window: DEFAULT_TIMING_WINDOW,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            output_dir: config.batch.output_dir.clone(),
            base_timeout: Duration::from_secs(config.batch.unit_timeout_secs),
            max_timeout: Duration::from_secs(config.batch.max_unit_timeout_secs),
            timeout_reference_bytes: config.batch.timeout_reference_bytes,
            acquire_timeout: Duration::from_secs(config.pool.acquire_timeout_secs),
            timing_window: DEFAULT_TIMING_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    #[test]
    fn test_from_config() {
        let config = load_config_from_str(
            r#"
[batch]
input_dir = "/in"
output_dir = "/out"
unit_timeout_secs = 10
max_unit_timeout_secs = 100

[pool]
acquire_timeout_secs = 7

[engine]
path = "/usr/bin/engine"
"#,
        )
        .unwrap();

        let pc = ProcessorConfig::from_config(&config);
        assert_eq!(pc.output_dir, PathBuf::from("/out"));
        assert_eq!(pc.base_timeout, Duration::from_secs(10));
        assert_eq!(pc.max_timeout, Duration::from_secs(100));
        assert_eq!(pc.acquire_timeout, Duration::from_secs(7));
    }
}
