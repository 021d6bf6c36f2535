//! Worker count recommendations from live resource pressure.

mod adaptive;

pub use adaptive::{AdaptiveScaler, ThroughputSample};
