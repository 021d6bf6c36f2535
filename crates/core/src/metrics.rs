//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Unit processing (outcomes, durations)
//! - Instance pool (size, acquire timeouts, replacements)
//! - Orchestration (workers, chunks, retries)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Units
// =============================================================================

/// Units processed total by result.
pub static UNITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("docbatch_units_total", "Total units processed"),
        &["result"], // "completed", "failed", "timed_out", "deferred"
    )
    .unwrap()
});

/// Unit processing duration in seconds.
pub static UNIT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "docbatch_unit_duration_seconds",
            "Duration of a single unit parse",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Instance pool
// =============================================================================

/// Live engine instances.
pub static POOL_INSTANCES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("docbatch_pool_instances", "Live engine instances in the pool").unwrap()
});

/// Acquire attempts that timed out.
pub static POOL_ACQUIRE_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "docbatch_pool_acquire_timeouts_total",
        "Pool acquire attempts that timed out",
    )
    .unwrap()
});

/// Instances replaced by the health checker.
pub static POOL_REPLACEMENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "docbatch_pool_replacements_total",
        "Unhealthy engine instances replaced",
    )
    .unwrap()
});

// =============================================================================
// Orchestration
// =============================================================================

/// Current worker count chosen by the scaler.
pub static WORKERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("docbatch_workers", "Current worker count").unwrap());

/// Chunks dispatched.
pub static CHUNKS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("docbatch_chunks_total", "Total chunks dispatched").unwrap());

/// Units re-attempted in the retry phase.
pub static RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("docbatch_retries_total", "Units re-attempted after failure").unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Units
        Box::new(UNITS_TOTAL.clone()),
        Box::new(UNIT_DURATION.clone()),
        // Pool
        Box::new(POOL_INSTANCES.clone()),
        Box::new(POOL_ACQUIRE_TIMEOUTS.clone()),
        Box::new(POOL_REPLACEMENTS.clone()),
        // Orchestration
        Box::new(WORKERS.clone()),
        Box::new(CHUNKS_TOTAL.clone()),
        Box::new(RETRIES_TOTAL.clone()),
    ]
}
