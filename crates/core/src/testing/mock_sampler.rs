//! Mock resource sampler for testing.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::resources::{ResourceSampler, ResourceSnapshot};

/// Returns scripted snapshots.
///
/// Queued snapshots are returned once each in order; after the queue drains
/// the last configured baseline is returned forever.
#[derive(Debug)]
pub struct MockSampler {
    baseline: Mutex<ResourceSnapshot>,
    queued: Mutex<VecDeque<ResourceSnapshot>>,
    samples: Mutex<usize>,
}

impl MockSampler {
    /// Create a sampler that always reports `baseline`.
    pub fn new(baseline: ResourceSnapshot) -> Self {
        Self {
            baseline: Mutex::new(baseline),
            queued: Mutex::new(VecDeque::new()),
            samples: Mutex::new(0),
        }
    }

    /// A roomy idle host: 16 cores, 64 GB with 48 GB free, plenty of fds.
    pub fn idle_host() -> Self {
        Self::new(super::fixtures::snapshot(5.0, 64.0, 48.0, 16))
    }

    /// Replace the baseline snapshot.
    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.baseline.lock().unwrap() = snapshot;
    }

    /// Queue a snapshot to be returned by the next sample.
    pub fn push(&self, snapshot: ResourceSnapshot) {
        self.queued.lock().unwrap().push_back(snapshot);
    }

    /// Number of samples taken so far.
    pub fn sample_count(&self) -> usize {
        *self.samples.lock().unwrap()
    }
}

impl ResourceSampler for MockSampler {
    fn sample(&self) -> ResourceSnapshot {
        *self.samples.lock().unwrap() += 1;
        if let Some(next) = self.queued.lock().unwrap().pop_front() {
            return next;
        }
        *self.baseline.lock().unwrap()
    }
}
