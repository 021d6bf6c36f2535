//! Crash-safe JSON persistence.
//!
//! State files are written to a uniquely named sibling temp file, synced, and
//! renamed over the target. A reader therefore sees either the previous or the
//! new complete document, never a partial write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while reading or writing state files.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| PersistError::io(&parent, e))?;

    // The temp file is removed on drop if anything below fails.
    let mut temp = tempfile::Builder::new()
        .prefix(&temp_prefix(path))
        .tempfile_in(&parent)
        .map_err(|e| PersistError::io(&parent, e))?;
    temp.write_all(bytes)
        .map_err(|e| PersistError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| PersistError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

/// Read a JSON state file. Returns `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistError::io(path, e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PersistError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Remove temp files left behind by writers that died before renaming.
///
/// Returns the number of files removed.
pub fn remove_stale_temps(path: &Path) -> usize {
    let Some(parent) = path.parent() else {
        return 0;
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    let prefix = temp_prefix(path);

    let Ok(entries) = fs::read_dir(parent) else {
        return 0;
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .filter(|entry| fs::remove_file(entry.path()).is_ok())
        .count()
}

/// Prefix shared by every temp file written for `path`.
fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    format!(".{}.tmp-", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct State {
        items: Vec<String>,
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");

        let state = State {
            items: vec!["a".into(), "b".into()],
        };
        write_json_atomic(&path, &state).unwrap();

        let loaded: State = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<State> = read_json(&dir.path().join("missing.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{\"items\": [\"a\"").unwrap();

        let err = read_json::<State>(&path).unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { .. }));
    }

    #[test]
    fn test_interrupted_write_leaves_previous_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let previous = State {
            items: vec!["done".into()],
        };
        write_json_atomic(&path, &previous).unwrap();

        // A writer killed before rename leaves only a truncated temp file.
        let orphan = dir.path().join(".state.json.tmp-deadbeef");
        fs::write(&orphan, b"{\"items\": [\"do").unwrap();

        let loaded: State = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, previous);

        assert_eq!(remove_stale_temps(&path), 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn test_no_temp_files_after_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        for i in 0..5 {
            write_json_atomic(&path, &State { items: vec![i.to_string()] }).unwrap();
        }
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_stale_temp_matches_writer_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        // Leave a temp file behind exactly as an interrupted writer would.
        let orphan = tempfile::Builder::new()
            .prefix(&temp_prefix(&path))
            .tempfile_in(dir.path())
            .unwrap();
        let (_, orphan_path) = orphan.keep().unwrap();
        write_json_atomic(&path, &State { items: vec!["x".into()] }).unwrap();

        // Neighbouring state files are not touched.
        fs::write(dir.path().join(".other.json.tmp-1"), b"{}").unwrap();

        assert_eq!(remove_stale_temps(&path), 1);
        assert!(!orphan_path.exists());
        assert!(path.exists());
        assert!(dir.path().join(".other.json.tmp-1").exists());
    }

    #[test]
    fn test_write_creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/state.json");
        write_atomic(&path, b"{\"items\":[]}").unwrap();
        let loaded: State = read_json(&path).unwrap().unwrap();
        assert!(loaded.items.is_empty());
    }
}
