//! Prometheus metrics for a batch run.
//!
//! The runner registers the core collectors (units, pool, workers, chunks,
//! retries) next to its own run-level metrics and logs the text exposition
//! when the run ends.

use once_cell::sync::Lazy;
use prometheus::{self, Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};

use docbatch_core::{BatchSummary, RunOutcome};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Finished runs by outcome.
pub static RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("docbatch_runs_total", "Finished batch runs by outcome"),
        &["outcome"],
    )
    .unwrap()
});

/// Wall time of the last run.
pub static RUN_DURATION_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "docbatch_run_duration_seconds",
        "Wall time of the last batch run in seconds",
    )
    .unwrap()
});

/// Successful units per second in the last run.
pub static RUN_THROUGHPUT: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "docbatch_run_throughput_units_per_second",
        "Successful units per second in the last batch run",
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    registry.register(Box::new(RUNS_TOTAL.clone())).unwrap();
    registry
        .register(Box::new(RUN_DURATION_SECONDS.clone()))
        .unwrap();
    registry.register(Box::new(RUN_THROUGHPUT.clone())).unwrap();

    // Core metrics (units, pool, orchestration)
    for metric in docbatch_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

pub fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Aborted { .. } => "aborted",
        RunOutcome::TooManyFailures { .. } => "too_many_failures",
        RunOutcome::Cancelled => "cancelled",
    }
}

/// Record the run-level metrics of a finished batch.
pub fn record_summary(summary: &BatchSummary) {
    RUNS_TOTAL
        .with_label_values(&[outcome_label(&summary.outcome)])
        .inc();
    RUN_DURATION_SECONDS.set(summary.duration_secs);
    RUN_THROUGHPUT.set(summary.throughput);
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
