//! Work unit discovery.
//!
//! Walks the input tree once, collecting only path and size metadata (never
//! document contents), drops units that should not run, and hands the rest
//! out smallest-first in chunks.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One document to process. Identity is `id`: the path relative to the input
/// root with `/` separators, stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub size_bytes: u64,
    pub source: PathBuf,
}

/// Why a discovered file is not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Recorded as processed by the checkpoint.
    Processed,
    /// Retry attempts exhausted.
    Exhausted,
    /// Still waiting out a retry backoff.
    BackingOff,
}

/// Filters applied while walking.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Files larger than this are skipped.
    pub max_unit_bytes: u64,
    /// Accepted extensions without the dot, case-insensitive (empty = all).
    pub extensions: Vec<String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            max_unit_bytes: u64::MAX,
            extensions: Vec::new(),
        }
    }
}

impl DiscoveryOptions {
    fn accepts_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

/// Counters collected during one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    /// Regular files seen.
    pub seen: usize,
    /// Units queued for this run.
    pub queued: usize,
    pub already_processed: usize,
    pub exhausted: usize,
    pub backing_off: usize,
    pub empty: usize,
    pub oversized: usize,
    pub wrong_extension: usize,
    pub unreadable: usize,
}

/// Units queued for a run, ordered by ascending size.
#[derive(Debug, Default)]
pub struct UnitQueue {
    units: VecDeque<WorkUnit>,
}

impl UnitQueue {
    pub fn from_units(mut units: Vec<WorkUnit>) -> Self {
        units.sort_by(|a, b| a.size_bytes.cmp(&b.size_bytes).then_with(|| a.id.cmp(&b.id)));
        Self {
            units: units.into(),
        }
    }

    /// Take up to `size` units. Returns an empty vec once drained.
    pub fn next_chunk(&mut self, size: usize) -> Vec<WorkUnit> {
        let take = size.max(1).min(self.units.len());
        self.units.drain(..take).collect()
    }

    pub fn remaining(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Walk `root` and queue every unit that should run.
///
/// `skip` is consulted with each unit id before the unit is queued. Hidden
/// files and directories (leading `.`) are ignored and directory symlinks are
/// never descended into. Ignore files (`.gitignore`, `.ignore`) have no effect:
/// every regular file under the root is a candidate.
///
/// Only paths and sizes are held, never contents. The full candidate list is
/// collected before the first chunk runs so that it can be ordered by size.
pub fn discover_units<F>(
    root: &Path,
    options: &DiscoveryOptions,
    skip: F,
) -> io::Result<(UnitQueue, DiscoveryStats)>
where
    F: Fn(&str) -> Option<SkipReason>,
{
    // The root itself must be readable; nested failures are only counted.
    fs::read_dir(root).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Cannot read input directory '{}': {}", root.display(), e),
        )
    })?;

    let mut builder = WalkBuilder::new(root);
    builder
        .follow_links(false)
        .hidden(true)
        .parents(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .sort_by_file_name(|a, b| a.cmp(b));

    let mut stats = DiscoveryStats::default();
    let mut units = Vec::new();

    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                stats.unreadable += 1;
                continue;
            }
        };

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        // File symlinks count as their target; directory symlinks are skipped.
        let meta = if file_type.is_file() {
            match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => {
                    stats.unreadable += 1;
                    continue;
                }
            }
        } else if file_type.is_symlink() {
            match fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => target,
                _ => continue,
            }
        } else {
            continue;
        };

        stats.seen += 1;
        let path = entry.into_path();

        if !options.accepts_extension(&path) {
            stats.wrong_extension += 1;
            continue;
        }
        let size = meta.len();
        if size == 0 {
            stats.empty += 1;
            continue;
        }
        if size > options.max_unit_bytes {
            debug!("Skipping oversized file {:?} ({} bytes)", path, size);
            stats.oversized += 1;
            continue;
        }

        let Some(id) = unit_id(root, &path) else {
            stats.unreadable += 1;
            continue;
        };

        match skip(&id) {
            Some(SkipReason::Processed) => stats.already_processed += 1,
            Some(SkipReason::Exhausted) => stats.exhausted += 1,
            Some(SkipReason::BackingOff) => stats.backing_off += 1,
            None => units.push(WorkUnit {
                id,
                size_bytes: size,
                source: path,
            }),
        }
    }

    stats.queued = units.len();
    Ok((UnitQueue::from_units(units), stats))
}

/// Stable identifier for `path` under `root`.
pub fn unit_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, size: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; size]).unwrap();
    }

    #[test]
    fn test_discovery_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "big.txt", 300);
        write(root, "small.txt", 10);
        write(root, "nested/mid.txt", 100);
        write(root, "empty.txt", 0);
        write(root, "huge.txt", 5000);
        write(root, "image.png", 50);
        write(root, ".docbatch/checkpoint.json", 20);

        let options = DiscoveryOptions {
            max_unit_bytes: 1000,
            extensions: vec!["TXT".to_string()],
        };
        let (mut queue, stats) = discover_units(root, &options, |_| None).unwrap();

        assert_eq!(stats.seen, 6);
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.empty, 1);
        assert_eq!(stats.oversized, 1);
        assert_eq!(stats.wrong_extension, 1);

        let ids: Vec<String> = queue.next_chunk(10).into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["small.txt", "nested/mid.txt", "big.txt"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_skip_callback_excludes_at_source() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            write(dir.path(), &format!("doc{}.txt", i), 10 + i);
        }

        let (queue, stats) = discover_units(dir.path(), &DiscoveryOptions::default(), |id| {
            match id {
                "doc0.txt" | "doc1.txt" => Some(SkipReason::Processed),
                "doc2.txt" => Some(SkipReason::Exhausted),
                "doc3.txt" => Some(SkipReason::BackingOff),
                _ => None,
            }
        })
        .unwrap();

        assert_eq!(queue.remaining(), 2);
        assert_eq!(stats.already_processed, 2);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.backing_off, 1);
    }

    #[test]
    fn test_chunks_never_overlap() {
        let units: Vec<WorkUnit> = (0..10)
            .map(|i| WorkUnit {
                id: format!("u{}", i),
                size_bytes: 10 - i,
                source: PathBuf::from(format!("/in/u{}", i)),
            })
            .collect();
        let mut queue = UnitQueue::from_units(units);

        let first = queue.next_chunk(4);
        let second = queue.next_chunk(4);
        let third = queue.next_chunk(4);
        assert_eq!((first.len(), second.len(), third.len()), (4, 4, 2));
        assert!(queue.next_chunk(4).is_empty());
        assert!(first.iter().all(|u| !second.contains(u) && !third.contains(u)));
        assert_eq!(first[0].size_bytes, 1);
    }

    #[test]
    fn test_missing_root_is_error() {
        let result = discover_units(
            Path::new("/nonexistent/docbatch-input"),
            &DiscoveryOptions::default(),
            |_| None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ignore_files_do_not_hide_units() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "keep.txt", 10);
        write(root, "skipped-by-git.txt", 10);
        write(root, "build/out.txt", 10);
        fs::write(root.join(".gitignore"), "skipped-by-git.txt\nbuild/\n").unwrap();
        fs::write(root.join(".ignore"), "keep.txt\n").unwrap();

        let (queue, stats) = discover_units(root, &DiscoveryOptions::default(), |_| None).unwrap();

        // The ignore files themselves are hidden; everything else is queued.
        assert_eq!(stats.seen, 3);
        assert_eq!(queue.remaining(), 3);
        assert_eq!(stats.unreadable, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlinks_not_followed() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        write(outside.path(), "elsewhere.txt", 10);
        write(dir.path(), "inside.txt", 10);
        write(dir.path(), "real/linked.txt", 10);
        std::os::unix::fs::symlink(outside.path(), dir.path().join("outside")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("real/linked.txt"),
            dir.path().join("alias.txt"),
        )
        .unwrap();

        let (mut queue, stats) =
            discover_units(dir.path(), &DiscoveryOptions::default(), |_| None).unwrap();

        let mut ids: Vec<String> = queue.next_chunk(10).into_iter().map(|u| u.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["alias.txt", "inside.txt", "real/linked.txt"]);
        assert_eq!(stats.seen, 3);
    }

    #[test]
    fn test_unit_id_is_relative() {
        let root = Path::new("/data/in");
        assert_eq!(
            unit_id(root, Path::new("/data/in/a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(unit_id(root, Path::new("/elsewhere/b.txt")), None);
    }
}
