//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the engine and resource
//! traits, allowing whole batch runs to be exercised without a real engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use docbatch_core::testing::{fixtures, MockEngineFactory, MockSampler};
//!
//! let factory = MockEngineFactory::new();
//! factory.fail_always("broken.txt");
//! let sampler = MockSampler::idle_host();
//!
//! let input = tempfile::TempDir::new()?;
//! fixtures::write_units(input.path(), 10, 128);
//! ```

mod mock_engine;
mod mock_sampler;

pub use mock_engine::{MockEngine, MockEngineFactory};
pub use mock_sampler::MockSampler;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::fs;
    use std::path::{Path, PathBuf};

    use crate::discovery::WorkUnit;
    use crate::resources::ResourceSnapshot;

    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    /// Build a snapshot from human units. File descriptors are 100 open out of
    /// a 65536 limit.
    pub fn snapshot(
        cpu_percent: f64,
        total_gb: f64,
        available_gb: f64,
        cpu_count: usize,
    ) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent,
            total_memory_bytes: (total_gb * GB) as u64,
            available_memory_bytes: (available_gb * GB) as u64,
            open_fds: Some(100),
            fd_limit: Some(65536),
            cpu_count,
        }
    }

    /// A work unit that does not need to exist on disk.
    pub fn work_unit(id: &str, size_bytes: u64) -> WorkUnit {
        WorkUnit {
            id: id.to_string(),
            size_bytes,
            source: PathBuf::from("/nonexistent").join(id),
        }
    }

    /// Write one file of `size` bytes, creating parent directories.
    pub fn write_file(root: &Path, relative: &str, size: usize) -> PathBuf {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![b'x'; size]).unwrap();
        path
    }

    /// Write `count` files named `doc-00000.txt`, ... of `size` bytes each.
    /// Returns their unit ids in name order.
    pub fn write_units(root: &Path, count: usize, size: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let name = format!("doc-{:05}.txt", i);
                write_file(root, &name, size);
                name
            })
            .collect()
    }
}
