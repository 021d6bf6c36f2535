use std::sync::Mutex;

use serde::Serialize;
use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Host resource readings taken at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Global CPU utilisation, 0-100.
    pub cpu_percent: f64,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    /// Open file descriptors of this process, when the platform exposes them.
    pub open_fds: Option<u64>,
    /// Soft limit on open file descriptors.
    pub fd_limit: Option<u64>,
    pub cpu_count: usize,
}

impl ResourceSnapshot {
    /// Available memory in GB.
    pub fn available_gb(&self) -> f64 {
        self.available_memory_bytes as f64 / BYTES_PER_GB
    }

    /// Fraction of memory in use, 0.0-1.0.
    pub fn memory_utilization(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 0.0;
        }
        let used = self
            .total_memory_bytes
            .saturating_sub(self.available_memory_bytes);
        used as f64 / self.total_memory_bytes as f64
    }

    /// Remaining file descriptor headroom, if both readings are known.
    pub fn fd_headroom(&self) -> Option<u64> {
        match (self.fd_limit, self.open_fds) {
            (Some(limit), Some(open)) => Some(limit.saturating_sub(open)),
            _ => None,
        }
    }

    /// Render a concise log line.
    pub fn to_log_string(&self) -> String {
        format!(
            "cpu={:.1}% mem_avail={:.2}GB mem_used={:.0}% fds={}/{}",
            self.cpu_percent,
            self.available_gb(),
            self.memory_utilization() * 100.0,
            self.open_fds
                .map(|v| v.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            self.fd_limit
                .map(|v| v.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
        )
    }
}

/// Source of resource snapshots.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// Samples the real host through `sysinfo`.
///
/// CPU usage is a delta between refreshes, so the `System` is kept between
/// calls; the very first reading may report 0%.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> ResourceSnapshot {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let available = match system.available_memory() {
            0 => total.saturating_sub(system.used_memory()),
            n => n,
        };

        ResourceSnapshot {
            cpu_percent: system.global_cpu_usage() as f64,
            total_memory_bytes: total,
            available_memory_bytes: available,
            open_fds: count_open_fds(),
            fd_limit: fd_soft_limit(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

fn count_open_fds() -> Option<u64> {
    #[cfg(target_os = "linux")]
    let dir = "/proc/self/fd";
    #[cfg(not(target_os = "linux"))]
    let dir = "/dev/fd";

    std::fs::read_dir(dir)
        .ok()
        .map(|entries| entries.count() as u64)
}

#[cfg(unix)]
fn fd_soft_limit() -> Option<u64> {
    use nix::sys::resource::{getrlimit, Resource};

    getrlimit(Resource::RLIMIT_NOFILE)
        .ok()
        .map(|(soft, _hard)| soft as u64)
}

#[cfg(not(unix))]
fn fd_soft_limit() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(total_gb: u64, available_gb: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 10.0,
            total_memory_bytes: total_gb * 1024 * 1024 * 1024,
            available_memory_bytes: available_gb * 1024 * 1024 * 1024,
            open_fds: Some(100),
            fd_limit: Some(1024),
            cpu_count: 4,
        }
    }

    #[test]
    fn test_memory_utilization() {
        let snap = snapshot(16, 4);
        assert!((snap.memory_utilization() - 0.75).abs() < 1e-9);
        assert!((snap.available_gb() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_memory() {
        let snap = snapshot(0, 0);
        assert_eq!(snap.memory_utilization(), 0.0);
    }

    #[test]
    fn test_fd_headroom() {
        let mut snap = snapshot(16, 8);
        assert_eq!(snap.fd_headroom(), Some(924));
        snap.open_fds = None;
        assert_eq!(snap.fd_headroom(), None);
    }

    #[test]
    fn test_system_sampler_reports_memory() {
        let sampler = SystemSampler::new();
        let snap = sampler.sample();
        assert!(snap.total_memory_bytes > 0);
        assert!(snap.available_memory_bytes <= snap.total_memory_bytes);
        assert!(snap.cpu_count >= 1);
        assert!((0.0..=1.0).contains(&snap.memory_utilization()));
    }
}
