use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::ScalerConfig;
use crate::resources::{ResourceSampler, ResourceSnapshot};

/// Fraction of the remaining fd headroom workers may claim.
const FD_HEADROOM_SHARE: f64 = 0.5;

/// Units completed over a wall-clock interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub units: usize,
    pub elapsed_secs: f64,
}

impl ThroughputSample {
    /// Units per second.
    pub fn rate(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.units as f64 / self.elapsed_secs
    }
}

/// Recommends worker counts with hysteresis.
///
/// Growth is gradual (+1 per adjustment), shrinking is immediate, and every
/// change starts a cooldown during which further changes are ignored.
pub struct AdaptiveScaler {
    sampler: Arc<dyn ResourceSampler>,
    config: ScalerConfig,
    max_workers: usize,
    history: VecDeque<ThroughputSample>,
    last_change: Option<Instant>,
    last_snapshot: Option<ResourceSnapshot>,
}

impl AdaptiveScaler {
    pub fn new(sampler: Arc<dyn ResourceSampler>, config: ScalerConfig, max_workers: usize) -> Self {
        Self {
            sampler,
            history: VecDeque::with_capacity(config.history_size),
            config,
            max_workers: max_workers.max(1),
            last_change: None,
            last_snapshot: None,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Snapshot taken by the most recent sample.
    pub fn last_snapshot(&self) -> Option<ResourceSnapshot> {
        self.last_snapshot
    }

    /// Take a fresh resource sample.
    pub fn sample(&mut self) -> ResourceSnapshot {
        let snapshot = self.sampler.sample();
        self.last_snapshot = Some(snapshot);
        snapshot
    }

    /// Worker count the host can sustain right now.
    pub fn optimal_workers(&mut self) -> usize {
        let snapshot = self.sample();
        self.optimal_for(&snapshot)
    }

    /// Worker count a given snapshot can sustain.
    ///
    /// The minimum of CPU, memory and fd headroom, capped at the worker
    /// limit and never below one.
    pub fn optimal_for(&self, snapshot: &ResourceSnapshot) -> usize {
        let mut optimal = self.max_workers;

        if self.config.cpu_per_worker_pct > 0.0 {
            let idle = (100.0 - snapshot.cpu_percent).max(0.0);
            optimal = optimal.min((idle / self.config.cpu_per_worker_pct).floor() as usize);
        }

        if self.config.per_worker_memory_gb > 0.0 {
            let by_memory = (snapshot.available_gb() / self.config.per_worker_memory_gb).floor();
            optimal = optimal.min(by_memory as usize);
        }

        if let Some(headroom) = snapshot.fd_headroom() {
            if self.config.per_worker_fds > 0 {
                let usable = headroom as f64 * FD_HEADROOM_SHARE;
                optimal = optimal.min((usable / self.config.per_worker_fds as f64).floor() as usize);
            }
        }

        optimal.max(1)
    }

    /// Record the throughput of a finished chunk.
    pub fn record_throughput(&mut self, units_done: usize, elapsed_secs: f64) {
        if self.history.len() >= self.config.history_size.max(2) {
            self.history.pop_front();
        }
        self.history.push_back(ThroughputSample {
            units: units_done,
            elapsed_secs,
        });
    }

    pub fn history(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.history.iter()
    }

    /// Whether the last sample is slower than the one before it.
    pub fn throughput_falling(&self) -> bool {
        let mut recent = self.history.iter().rev();
        match (recent.next(), recent.next()) {
            (Some(last), Some(previous)) => last.rate() < previous.rate(),
            _ => false,
        }
    }

    /// Recommend the next worker count given the current one.
    pub fn adjust(&mut self, current: usize) -> usize {
        self.adjust_at(current, Instant::now())
    }

    pub fn adjust_at(&mut self, current: usize, now: Instant) -> usize {
        let current = current.clamp(1, self.max_workers);

        if let Some(last) = self.last_change {
            let cooldown = Duration::from_secs(self.config.cooldown_secs);
            if now.saturating_duration_since(last) < cooldown {
                return current;
            }
        }

        let optimal = self.optimal_workers();
        let next = if optimal > current {
            current + 1
        } else if optimal < current {
            if self.throughput_falling() {
                current - 1
            } else {
                optimal
            }
        } else {
            current
        };
        let next = next.clamp(1, self.max_workers);

        if next != current {
            self.last_change = Some(now);
            info!(
                from = current,
                to = next,
                optimal,
                "Adjusted worker count ({})",
                self.last_snapshot
                    .map(|s| s.to_log_string())
                    .unwrap_or_default()
            );
        } else {
            debug!(workers = current, optimal, "Worker count unchanged");
        }
        next
    }

    /// Shrink by one after the pool ran dry. Ignores and restarts the cooldown.
    pub fn back_off(&mut self, current: usize) -> usize {
        let next = current.saturating_sub(1).max(1);
        if next != current {
            self.last_change = Some(Instant::now());
            info!(from = current, to = next, "Pool exhausted, reducing workers");
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, MockSampler};

    fn config(cooldown_secs: u64) -> ScalerConfig {
        ScalerConfig {
            cooldown_secs,
            ..ScalerConfig::default()
        }
    }

    fn scaler(snapshot: ResourceSnapshot, cooldown_secs: u64, max: usize) -> (AdaptiveScaler, Arc<MockSampler>) {
        let sampler = Arc::new(MockSampler::new(snapshot));
        let scaler = AdaptiveScaler::new(sampler.clone(), config(cooldown_secs), max);
        (scaler, sampler)
    }

    #[test]
    fn test_optimal_takes_minimum_constraint() {
        // cpu: (100-20)/20 = 4, memory: 10/1 = 10
        let (mut s, _) = scaler(fixtures::snapshot(20.0, 32.0, 10.0, 16), 0, 16);
        assert_eq!(s.optimal_workers(), 4);

        // memory: 2.5/1 = 2
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 32.0, 2.5, 16), 0, 16);
        assert_eq!(s.optimal_workers(), 2);

        // capped at max
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 64.0, 60.0, 16), 0, 3);
        assert_eq!(s.optimal_workers(), 3);
    }

    #[test]
    fn test_optimal_fd_headroom() {
        // cpu: 100/20 = 5, memory: 60/1 = 60
        let mut snap = fixtures::snapshot(0.0, 64.0, 60.0, 16);
        snap.fd_limit = Some(1024);
        snap.open_fds = Some(768);
        // (1024-768) * 0.5 / 32 = 4
        let sampler = Arc::new(MockSampler::new(snap));
        let mut s = AdaptiveScaler::new(
            sampler,
            ScalerConfig {
                per_worker_fds: 32,
                ..config(0)
            },
            16,
        );
        assert_eq!(s.optimal_workers(), 4);

        // Without the fd limit the cpu bound takes over.
        snap.fd_limit = None;
        assert_eq!(s.optimal_for(&snap), 5);
    }

    #[test]
    fn test_optimal_never_below_one() {
        let (mut s, _) = scaler(fixtures::snapshot(100.0, 32.0, 0.1, 16), 0, 8);
        assert_eq!(s.optimal_workers(), 1);
    }

    #[test]
    fn test_scale_up_is_gradual() {
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 64.0, 60.0, 16), 0, 8);
        assert_eq!(s.adjust(1), 2);
        assert_eq!(s.adjust(2), 3);
    }

    #[test]
    fn test_scale_down_jumps_to_optimum() {
        // optimum = 2 (memory)
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 64.0, 2.0, 16), 0, 8);
        assert_eq!(s.adjust(8), 2);
    }

    #[test]
    fn test_falling_throughput_scales_down_by_one() {
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 64.0, 2.0, 16), 0, 8);
        s.record_throughput(100, 10.0);
        s.record_throughput(50, 10.0);
        assert!(s.throughput_falling());
        assert_eq!(s.adjust(8), 7);
    }

    #[test]
    fn test_cooldown_holds_after_change() {
        let (mut s, sampler) = scaler(fixtures::snapshot(0.0, 64.0, 60.0, 16), 60, 8);
        let start = Instant::now();

        assert_eq!(s.adjust_at(2, start), 3);
        // Within cooldown nothing moves, even under pressure.
        sampler.set(fixtures::snapshot(0.0, 64.0, 1.0, 16));
        assert_eq!(s.adjust_at(3, start + Duration::from_secs(30)), 3);
        // After it, the drop applies.
        assert_eq!(s.adjust_at(3, start + Duration::from_secs(61)), 1);
    }

    #[test]
    fn test_back_off_floors_at_one() {
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 64.0, 60.0, 16), 0, 8);
        assert_eq!(s.back_off(3), 2);
        assert_eq!(s.back_off(1), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let (mut s, _) = scaler(fixtures::snapshot(0.0, 64.0, 60.0, 16), 0, 8);
        for i in 0..50 {
            s.record_throughput(i, 1.0);
        }
        assert_eq!(s.history().count(), ScalerConfig::default().history_size);
    }
}
