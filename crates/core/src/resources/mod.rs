//! Point-in-time host resource readings.
//!
//! The scaler and the orchestrator consume [`ResourceSnapshot`]s through the
//! [`ResourceSampler`] trait so tests can script memory or CPU pressure.

mod sampler;

pub use sampler::{ResourceSampler, ResourceSnapshot, SystemSampler};
