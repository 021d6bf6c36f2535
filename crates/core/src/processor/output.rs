//! Per-unit output files.
//!
//! Each unit gets one JSON-lines file: a start marker, the mapped records, and
//! an end marker carrying an error flag. Completeness is judged from the
//! markers alone, so a crashed run leaves files that classify as in progress.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::engine::Record;

/// Extension of output files.
pub const OUTPUT_EXTENSION: &str = "jsonl";

const START_MARKER: &str = "start";
const END_MARKER: &str = "end";

/// Completeness of one output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// No file, or no start marker.
    NotAttempted,
    /// Start marker without an end marker.
    InProgress,
    /// End marker with `error: false`.
    Complete,
    /// End marker with `error: true`.
    Failed,
}

/// Output file path for a unit: sanitized id plus a short hash so distinct ids
/// never collide after sanitizing.
pub fn output_path_for(output_dir: &Path, unit_id: &str) -> PathBuf {
    let digest = Sha256::digest(unit_id.as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();

    let mut stem: String = unit_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    stem.truncate(120);
    let stem = stem.trim_start_matches('.');

    output_dir.join(format!("{}-{}.{}", stem, hash, OUTPUT_EXTENSION))
}

/// Streams one unit's output file.
pub struct OutputWriter {
    path: PathBuf,
    unit_id: String,
    writer: BufWriter<tokio::fs::File>,
}

impl OutputWriter {
    /// Create (or truncate) the file and write the start marker.
    pub async fn begin(path: PathBuf, unit_id: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        let mut writer = Self {
            path,
            unit_id: unit_id.to_string(),
            writer: BufWriter::new(file),
        };

        let marker = json!({
            "marker": START_MARKER,
            "unit_id": unit_id,
            "started_at": Utc::now(),
        });
        writer.write_line(&marker).await?;
        writer.writer.flush().await?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&mut self, value: &impl Serialize) -> io::Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer.write_all(&line).await
    }

    pub async fn write_records(&mut self, records: &[Record]) -> io::Result<()> {
        for record in records {
            self.write_line(record).await?;
        }
        Ok(())
    }

    /// Write the end marker and sync the file.
    pub async fn finish(mut self, error: Option<&str>) -> io::Result<()> {
        let mut marker = json!({
            "marker": END_MARKER,
            "unit_id": self.unit_id,
            "error": error.is_some(),
            "finished_at": Utc::now(),
        });
        if let Some(message) = error {
            marker["message"] = Value::String(message.to_string());
        }
        self.write_line(&marker).await?;
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await
    }
}

fn marker_of(line: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("marker")?.as_str()?;
    Some(value)
}

/// Classify an output file by its markers.
pub fn scan_output(path: &Path) -> io::Result<OutputStatus> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(OutputStatus::NotAttempted),
        Err(e) => return Err(e),
    };

    let mut lines = BufReader::new(file)
        .lines()
        .filter(|l| l.as_ref().map_or(true, |s| !s.trim().is_empty()));

    let Some(first) = lines.next().transpose()? else {
        return Ok(OutputStatus::NotAttempted);
    };
    let starts = marker_of(&first)
        .is_some_and(|m| m["marker"] == START_MARKER);
    if !starts {
        return Ok(OutputStatus::NotAttempted);
    }

    let mut last = None;
    for line in lines {
        last = Some(line?);
    }

    let end = last
        .as_deref()
        .and_then(marker_of)
        .filter(|m| m["marker"] == END_MARKER);
    Ok(match end {
        None => OutputStatus::InProgress,
        Some(m) if m["error"].as_bool().unwrap_or(true) => OutputStatus::Failed,
        Some(_) => OutputStatus::Complete,
    })
}

/// Classification of every output file in a directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputScan {
    pub complete: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    pub in_progress: Vec<PathBuf>,
    pub not_attempted: Vec<PathBuf>,
}

impl OutputScan {
    pub fn total(&self) -> usize {
        self.complete.len() + self.failed.len() + self.in_progress.len() + self.not_attempted.len()
    }
}

/// Scan all output files directly inside `dir`.
pub fn scan_output_dir(dir: &Path) -> io::Result<OutputScan> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == OUTPUT_EXTENSION))
        .collect();
    paths.sort();

    let mut scan = OutputScan::default();
    for path in paths {
        match scan_output(&path)? {
            OutputStatus::Complete => scan.complete.push(path),
            OutputStatus::Failed => scan.failed.push(path),
            OutputStatus::InProgress => scan.in_progress.push(path),
            OutputStatus::NotAttempted => scan.not_attempted.push(path),
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_output_path_is_sanitized_and_distinct() {
        let dir = Path::new("/out");
        let a = output_path_for(dir, "a/b c.txt");
        let b = output_path_for(dir, "a_b c.txt");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("a_b_c.txt-"));
        assert!(name.ends_with(".jsonl"));
        assert_eq!(a.parent().unwrap(), dir);
    }

    #[test]
    fn test_missing_file_not_attempted() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            scan_output(&dir.path().join("none.jsonl")).unwrap(),
            OutputStatus::NotAttempted
        );
    }

    #[tokio::test]
    async fn test_complete_output() {
        let dir = TempDir::new().unwrap();
        let path = output_path_for(dir.path(), "doc.txt");

        let mut writer = OutputWriter::begin(path.clone(), "doc.txt").await.unwrap();
        assert_eq!(scan_output(&path).unwrap(), OutputStatus::InProgress);

        writer
            .write_records(&[Record::text("one"), Record::text("two")])
            .await
            .unwrap();
        writer.finish(None).await.unwrap();
        assert_eq!(scan_output(&path).unwrap(), OutputStatus::Complete);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["unit_id"], "doc.txt");
        assert_eq!(lines[1]["text"], "one");
        assert_eq!(lines[3]["error"], false);
    }

    #[tokio::test]
    async fn test_failed_output_carries_message() {
        let dir = TempDir::new().unwrap();
        let path = output_path_for(dir.path(), "doc.txt");

        let writer = OutputWriter::begin(path.clone(), "doc.txt").await.unwrap();
        writer.finish(Some("engine crashed")).await.unwrap();
        assert_eq!(scan_output(&path).unwrap(), OutputStatus::Failed);

        let content = std::fs::read_to_string(&path).unwrap();
        let last: Value = serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(last["message"], "engine crashed");
    }

    #[test]
    fn test_foreign_file_not_attempted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.jsonl");
        std::fs::write(&path, "{\"kind\":\"text\"}\n").unwrap();
        assert_eq!(scan_output(&path).unwrap(), OutputStatus::NotAttempted);
    }

    #[tokio::test]
    async fn test_scan_dir() {
        let dir = TempDir::new().unwrap();
        let done = OutputWriter::begin(output_path_for(dir.path(), "a"), "a")
            .await
            .unwrap();
        done.finish(None).await.unwrap();
        let _open = OutputWriter::begin(output_path_for(dir.path(), "b"), "b")
            .await
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let scan = scan_output_dir(dir.path()).unwrap();
        assert_eq!(scan.complete.len(), 1);
        assert_eq!(scan.in_progress.len(), 1);
        assert_eq!(scan.total(), 2);
    }
}
