//! Processes one work unit end to end against a leased engine client.

use std::collections::VecDeque;
use std::slice;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::config::ProcessorConfig;
use super::output::{output_path_for, OutputWriter};
use super::types::{UnitError, UnitOutcome};
use crate::discovery::WorkUnit;
use crate::engine::{EngineClient, EngineError, EngineFactory, RecordSet};
use crate::metrics;
use crate::pool::{InstancePool, PoolError};

/// Extra time granted on top of the unit timeout before the processor stops
/// waiting on a client that ignores its own deadline.
const CLIENT_GRACE: Duration = Duration::from_secs(5);

/// Recent average above this share of the timeout triggers inflation.
const INFLATE_WHEN_AVERAGE_ABOVE: f64 = 0.7;
const INFLATION_FACTOR: f64 = 1.5;

/// Runs single units through the engine.
///
/// Never touches the retry ledger or checkpoint; callers fold the returned
/// [`UnitOutcome`] into those.
pub struct UnitProcessor<F: EngineFactory> {
    pool: Arc<InstancePool<F>>,
    config: ProcessorConfig,
    recent: Mutex<VecDeque<Duration>>,
}

impl<F: EngineFactory> UnitProcessor<F> {
    pub fn new(pool: Arc<InstancePool<F>>, config: ProcessorConfig) -> Self {
        Self {
            pool,
            recent: Mutex::new(VecDeque::with_capacity(config.timing_window)),
            config,
        }
    }

    pub fn pool(&self) -> &Arc<InstancePool<F>> {
        &self.pool
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn recent_average(&self) -> Option<Duration> {
        let recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<Duration>() / recent.len() as u32)
    }

    fn record_duration(&self, elapsed: Duration) {
        let mut recent = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.len() >= self.config.timing_window.max(1) {
            recent.pop_front();
        }
        recent.push_back(elapsed);
    }

    /// Timeout for a unit: one base timeout per reference size on top of the
    /// base, inflated when recent units ran close to the limit, capped.
    pub fn timeout_for(&self, unit: &WorkUnit) -> Duration {
        let reference = self.config.timeout_reference_bytes.max(1) as f64;
        let scale = 1.0 + unit.size_bytes as f64 / reference;
        let mut timeout = self.config.base_timeout.mul_f64(scale).min(self.config.max_timeout);

        if let Some(average) = self.recent_average() {
            if average.as_secs_f64() > timeout.as_secs_f64() * INFLATE_WHEN_AVERAGE_ABOVE {
                timeout = timeout
                    .mul_f64(INFLATION_FACTOR)
                    .min(self.config.max_timeout);
            }
        }
        timeout
    }

    /// Process one unit. Never returns an error: every failure is part of the
    /// outcome.
    pub async fn process(&self, unit: &WorkUnit) -> UnitOutcome {
        let started = Instant::now();
        let outcome = self.run(unit, started).await;

        if !outcome.is_deferred() {
            self.record_duration(outcome.elapsed());
        }
        metrics::UNITS_TOTAL.with_label_values(&[outcome.label()]).inc();
        metrics::UNIT_DURATION
            .with_label_values(&[outcome.label()])
            .observe(outcome.elapsed().as_secs_f64());

        match &outcome {
            UnitOutcome::Completed { elapsed, records } => {
                debug!(unit = %unit.id, records, elapsed_ms = elapsed.as_millis() as u64, "Unit completed")
            }
            UnitOutcome::TimedOut { limit, .. } => {
                warn!(unit = %unit.id, limit_secs = limit.as_secs_f64(), "Unit timed out")
            }
            UnitOutcome::Failed { error, .. } => {
                warn!(unit = %unit.id, kind = ?error.kind, "Unit failed: {}", error)
            }
        }
        outcome
    }

    async fn run(&self, unit: &WorkUnit, started: Instant) -> UnitOutcome {
        let failed = |error: UnitError| UnitOutcome::Failed {
            elapsed: started.elapsed(),
            error,
        };

        let mut lease = match self.pool.acquire(self.config.acquire_timeout).await {
            Ok(lease) => lease,
            Err(e @ (PoolError::AcquireTimeout { .. } | PoolError::Closed)) => {
                return failed(UnitError::resource_exhaustion(e.to_string()))
            }
            Err(PoolError::Engine(e)) => {
                return failed(UnitError::transient(format!(
                    "engine instance unavailable: {}",
                    e
                )))
            }
        };

        let timeout = self.timeout_for(unit);
        let path = output_path_for(&self.config.output_dir, &unit.id);
        let mut writer = match OutputWriter::begin(path, &unit.id).await {
            Ok(w) => w,
            Err(e) => return failed(UnitError::transient(format!("cannot write output: {}", e))),
        };

        let result = match tokio::time::timeout(
            timeout + CLIENT_GRACE,
            lease.client().parse(slice::from_ref(unit), timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let outcome = match result.and_then(|sets| take_record_set(sets, &unit.id)) {
            Ok(set) => match writer.write_records(&set.records).await {
                Ok(()) => UnitOutcome::Completed {
                    elapsed: started.elapsed(),
                    records: set.records.len(),
                },
                Err(e) => failed(UnitError::transient(format!("cannot write output: {}", e))),
            },
            Err(EngineError::Timeout { .. }) => {
                lease.mark_broken();
                UnitOutcome::TimedOut {
                    elapsed: started.elapsed(),
                    limit: timeout,
                }
            }
            Err(e) => {
                if e.poisons_client() {
                    lease.mark_broken();
                }
                if e.is_retryable() {
                    failed(UnitError::transient(e.to_string()))
                } else {
                    failed(UnitError::content(e.to_string()))
                }
            }
        };
        drop(lease);

        let message = outcome.error_message();
        if let Err(e) = writer.finish(message.as_deref()).await {
            if outcome.is_success() {
                return failed(UnitError::transient(format!("cannot finish output: {}", e)));
            }
            warn!(unit = %unit.id, "Failed to write end marker: {}", e);
        }
        outcome
    }
}

/// The record set answering `unit_id`. An answer for any other unit means the
/// client is out of step with its engine.
fn take_record_set(sets: Vec<RecordSet>, unit_id: &str) -> Result<RecordSet, EngineError> {
    let mut others = Vec::new();
    for set in sets {
        if set.unit_id == unit_id {
            return Ok(set);
        }
        others.push(set.unit_id);
    }
    if others.is_empty() {
        Err(EngineError::protocol(format!("no records returned for {}", unit_id)))
    } else {
        Err(EngineError::protocol(format!(
            "expected records for {}, got {}",
            unit_id,
            others.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{scan_output, OutputStatus, UnitErrorKind};
    use crate::testing::{fixtures, MockEngineFactory};
    use tempfile::TempDir;

    fn processor(
        factory: MockEngineFactory,
        out: &TempDir,
        instances: usize,
    ) -> UnitProcessor<MockEngineFactory> {
        let mut config = ProcessorConfig::new(out.path());
        config.base_timeout = Duration::from_millis(200);
        config.max_timeout = Duration::from_secs(2);
        config.acquire_timeout = Duration::from_millis(100);
        UnitProcessor::new(Arc::new(InstancePool::new(factory, instances)), config)
    }

    #[tokio::test]
    async fn test_success_writes_complete_output() {
        let out = TempDir::new().unwrap();
        let factory = MockEngineFactory::new();
        factory.set_records_per_unit(3);
        let p = processor(factory, &out, 1);

        let unit = fixtures::work_unit("a.txt", 10);
        let outcome = p.process(&unit).await;
        assert!(matches!(outcome, UnitOutcome::Completed { records: 3, .. }));

        let path = output_path_for(out.path(), "a.txt");
        assert_eq!(scan_output(&path).unwrap(), OutputStatus::Complete);
        assert_eq!(p.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_client() {
        let out = TempDir::new().unwrap();
        let factory = MockEngineFactory::new();
        factory.fail_transiently("a.txt", 1);
        let engines = factory.clone();
        let p = processor(factory, &out, 1);

        let outcome = p.process(&fixtures::work_unit("a.txt", 10)).await;
        match &outcome {
            UnitOutcome::Failed { error, .. } => assert_eq!(error.kind, UnitErrorKind::Transient),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            scan_output(&output_path_for(out.path(), "a.txt")).unwrap(),
            OutputStatus::Failed
        );
        // Engine-reported errors do not poison the client.
        assert_eq!(engines.created_count(), 1);
        assert_eq!(p.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_mismatched_answer_is_protocol_error() {
        let out = TempDir::new().unwrap();
        let factory = MockEngineFactory::new();
        factory.answer_as("a.txt", "b.txt");
        let engines = factory.clone();
        let p = processor(factory, &out, 1);

        let outcome = p.process(&fixtures::work_unit("a.txt", 10)).await;
        match &outcome {
            UnitOutcome::Failed { error, .. } => {
                assert_eq!(error.kind, UnitErrorKind::Transient);
                assert!(error.message.contains("protocol"));
                assert!(error.message.contains("b.txt"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            scan_output(&output_path_for(out.path(), "a.txt")).unwrap(),
            OutputStatus::Failed
        );
        assert!(!output_path_for(out.path(), "b.txt").exists());
        // The out-of-step client is discarded.
        assert_eq!(p.pool().status().created, 0);
        assert!(p.process(&fixtures::work_unit("c.txt", 10)).await.is_success());
        assert_eq!(engines.created_count(), 2);
    }

    #[test]
    fn test_take_record_set_rejects_other_units() {
        let sets = vec![RecordSet {
            unit_id: "b.txt".into(),
            records: Vec::new(),
        }];
        assert!(matches!(
            take_record_set(sets, "a.txt"),
            Err(EngineError::Protocol(_))
        ));
        assert!(matches!(
            take_record_set(Vec::new(), "a.txt"),
            Err(EngineError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_input_is_content_error() {
        let out = TempDir::new().unwrap();
        let factory = MockEngineFactory::new();
        factory.reject_as_invalid("bad.txt");
        let p = processor(factory, &out, 1);

        let outcome = p.process(&fixtures::work_unit("bad.txt", 10)).await;
        assert!(outcome.is_permanent_failure());
    }

    #[tokio::test]
    async fn test_timeout_marks_client_broken() {
        let out = TempDir::new().unwrap();
        let factory = MockEngineFactory::new();
        factory.hang_on("slow.txt");
        let engines = factory.clone();
        let p = processor(factory, &out, 1);

        let outcome = p.process(&fixtures::work_unit("slow.txt", 0)).await;
        assert!(matches!(outcome, UnitOutcome::TimedOut { .. }));
        assert_eq!(p.pool().status().created, 0);
        assert_eq!(
            scan_output(&output_path_for(out.path(), "slow.txt")).unwrap(),
            OutputStatus::Failed
        );

        // Next unit gets a fresh client.
        assert!(p.process(&fixtures::work_unit("ok.txt", 0)).await.is_success());
        assert_eq!(engines.created_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_defers_without_output() {
        let out = TempDir::new().unwrap();
        let p = processor(MockEngineFactory::new(), &out, 1);

        let held = p.pool().acquire(Duration::from_secs(1)).await.unwrap();
        let outcome = p.process(&fixtures::work_unit("a.txt", 10)).await;
        drop(held);

        assert!(outcome.is_deferred());
        assert_eq!(
            scan_output(&output_path_for(out.path(), "a.txt")).unwrap(),
            OutputStatus::NotAttempted
        );
    }

    #[tokio::test]
    async fn test_timeout_grows_with_size() {
        let out = TempDir::new().unwrap();
        let mut p = processor(MockEngineFactory::new(), &out, 1);
        p.config.base_timeout = Duration::from_secs(10);
        p.config.max_timeout = Duration::from_secs(60);
        p.config.timeout_reference_bytes = 1000;

        assert_eq!(p.timeout_for(&fixtures::work_unit("a", 0)), Duration::from_secs(10));
        assert_eq!(p.timeout_for(&fixtures::work_unit("a", 1000)), Duration::from_secs(20));
        assert_eq!(p.timeout_for(&fixtures::work_unit("a", 100_000)), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_timeout_inflates_when_recent_units_are_slow() {
        let out = TempDir::new().unwrap();
        let mut p = processor(MockEngineFactory::new(), &out, 1);
        p.config.base_timeout = Duration::from_secs(10);
        p.config.max_timeout = Duration::from_secs(60);

        p.record_duration(Duration::from_secs(8));
        p.record_duration(Duration::from_secs(9));
        assert_eq!(p.timeout_for(&fixtures::work_unit("a", 0)), Duration::from_secs(15));
    }
}
