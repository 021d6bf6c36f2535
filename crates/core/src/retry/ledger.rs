use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointError;
use crate::config::RetryConfig;
use crate::discovery::SkipReason;
use crate::persist;

/// File name of the ledger inside the checkpoint directory.
pub const RETRY_LEDGER_FILE: &str = "retry_ledger.json";

/// Longest backoff the ledger will ever schedule (30 days).
pub const MAX_BACKOFF_SECS: u64 = 30 * 24 * 60 * 60;

/// Failure history of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub unit_id: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
    pub backoff_until: DateTime<Utc>,
    /// Content error: never retried regardless of attempts.
    #[serde(default)]
    pub permanent: bool,
}

/// Ledger statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub total: usize,
    pub exhausted: usize,
    pub in_backoff: usize,
    pub ready_for_retry: usize,
}

/// Attempts, last error and backoff deadline per failed unit.
///
/// Records are created on the first failure and deleted on success. A record
/// whose attempts reached the cap is exhausted: it is kept and reported, never
/// retried.
#[derive(Debug)]
pub struct RetryLedger {
    path: PathBuf,
    config: RetryConfig,
    records: BTreeMap<String, RetryRecord>,
}

impl RetryLedger {
    pub fn new(dir: impl AsRef<Path>, config: RetryConfig) -> Self {
        Self {
            path: dir.as_ref().join(RETRY_LEDGER_FILE),
            config,
            records: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Read the ledger from disk. A missing file yields an empty ledger.
    pub fn load(&mut self) -> Result<(), CheckpointError> {
        let stale = persist::remove_stale_temps(&self.path);
        if stale > 0 {
            warn!("Removed {} stale retry ledger temp file(s)", stale);
        }

        self.records = persist::read_json(&self.path)?.unwrap_or_default();

        // A lowered cap applies to records written under a higher one.
        let max = self.config.max_attempts;
        for record in self.records.values_mut() {
            record.attempts = record.attempts.min(max);
        }

        let stats = self.stats();
        info!(
            total = stats.total,
            exhausted = stats.exhausted,
            "Loaded retry ledger"
        );
        Ok(())
    }

    /// Atomically write the ledger.
    pub fn save(&self) -> Result<(), CheckpointError> {
        persist::write_json_atomic(&self.path, &self.records)?;
        Ok(())
    }

    pub fn get(&self, unit_id: &str) -> Option<&RetryRecord> {
        self.records.get(unit_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn exhausted_record(&self, record: &RetryRecord) -> bool {
        record.permanent || record.attempts >= self.config.max_attempts
    }

    pub fn is_exhausted(&self, unit_id: &str) -> bool {
        self.records
            .get(unit_id)
            .is_some_and(|r| self.exhausted_record(r))
    }

    /// Whether a unit may be attempted now.
    pub fn should_retry(&self, unit_id: &str) -> bool {
        self.should_retry_at(unit_id, Utc::now())
    }

    pub fn should_retry_at(&self, unit_id: &str, now: DateTime<Utc>) -> bool {
        self.skip_reason_at(unit_id, now).is_none()
    }

    /// Why discovery should leave a unit out, if it should.
    pub fn skip_reason_at(&self, unit_id: &str, now: DateTime<Utc>) -> Option<SkipReason> {
        let record = self.records.get(unit_id)?;
        if self.exhausted_record(record) {
            Some(SkipReason::Exhausted)
        } else if now < record.backoff_until {
            Some(SkipReason::BackingOff)
        } else {
            None
        }
    }

    /// Delay before the next attempt after `attempts` failures.
    ///
    /// Never longer than `max_backoff_secs` nor [`MAX_BACKOFF_SECS`].
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let cap = self.config.max_backoff_secs.min(MAX_BACKOFF_SECS) as f64;
        let secs = self
            .config
            .backoff_base
            .powi(attempts.min(i32::MAX as u32) as i32)
            .min(cap);
        Duration::milliseconds((secs * 1000.0) as i64)
    }

    /// Record a retryable failure.
    pub fn record_failure(&mut self, unit_id: &str, error: &str) {
        self.record_failure_at(unit_id, error, Utc::now());
    }

    pub fn record_failure_at(&mut self, unit_id: &str, error: &str, now: DateTime<Utc>) {
        let max = self.config.max_attempts;
        let attempts = self
            .records
            .get(unit_id)
            .map(|r| r.attempts)
            .unwrap_or(0)
            .saturating_add(1)
            .min(max);
        let deadline = now
            .checked_add_signed(self.backoff_for(attempts))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let record = self
            .records
            .entry(unit_id.to_string())
            .or_insert_with(|| RetryRecord {
                unit_id: unit_id.to_string(),
                attempts: 0,
                last_error: None,
                last_attempt_at: now,
                backoff_until: now,
                permanent: false,
            });
        record.attempts = attempts;
        record.last_error = Some(error.to_string());
        record.last_attempt_at = now;
        record.backoff_until = record.backoff_until.max(deadline);

        if attempts >= max {
            warn!(unit = unit_id, attempts, "Retry attempts exhausted: {}", error);
        } else {
            debug!(
                unit = unit_id,
                attempts,
                backoff_until = %record.backoff_until,
                "Recorded failure"
            );
        }
    }

    /// Record a failure that retrying cannot fix. The unit is exhausted at once.
    pub fn record_permanent_failure(&mut self, unit_id: &str, error: &str) {
        let now = Utc::now();
        let max = self.config.max_attempts;
        let record = self
            .records
            .entry(unit_id.to_string())
            .or_insert_with(|| RetryRecord {
                unit_id: unit_id.to_string(),
                attempts: 0,
                last_error: None,
                last_attempt_at: now,
                backoff_until: now,
                permanent: false,
            });
        record.attempts = max;
        record.permanent = true;
        record.last_error = Some(error.to_string());
        record.last_attempt_at = now;
        warn!(unit = unit_id, "Permanent failure, not retrying: {}", error);
    }

    /// Forget a unit after it succeeded.
    pub fn record_success(&mut self, unit_id: &str) {
        if self.records.remove(unit_id).is_some() {
            debug!(unit = unit_id, "Cleared retry record after success");
        }
    }

    /// Units whose backoff has expired and that still have attempts left.
    pub fn ready_for_retry(&self) -> Vec<String> {
        self.ready_for_retry_at(Utc::now())
    }

    pub fn ready_for_retry_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.records
            .values()
            .filter(|r| !self.exhausted_record(r) && r.backoff_until <= now)
            .map(|r| r.unit_id.clone())
            .collect()
    }

    /// Earliest backoff deadline among retryable units.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.records
            .values()
            .filter(|r| !self.exhausted_record(r))
            .map(|r| r.backoff_until)
            .min()
    }

    pub fn stats(&self) -> RetryStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> RetryStats {
        let mut stats = RetryStats {
            total: self.records.len(),
            ..Default::default()
        };
        for record in self.records.values() {
            if self.exhausted_record(record) {
                stats.exhausted += 1;
            } else if now < record.backoff_until {
                stats.in_backoff += 1;
            } else {
                stats.ready_for_retry += 1;
            }
        }
        stats
    }

    /// Exhausted records, ordered by unit id.
    pub fn exhausted(&self) -> Vec<&RetryRecord> {
        self.records
            .values()
            .filter(|r| self.exhausted_record(r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger(dir: &Path, max_attempts: u32) -> RetryLedger {
        RetryLedger::new(
            dir,
            RetryConfig {
                max_attempts,
                backoff_base: 2.0,
                max_backoff_secs: 3600,
            },
        )
    }

    #[test]
    fn test_unknown_unit_should_retry() {
        let dir = TempDir::new().unwrap();
        assert!(ledger(dir.path(), 3).should_retry("a"));
    }

    #[test]
    fn test_backoff_blocks_until_deadline() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 3);
        let now = Utc::now();

        l.record_failure_at("a", "boom", now);
        let record = l.get("a").unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.backoff_until, now + Duration::seconds(2));

        assert!(!l.should_retry_at("a", now + Duration::seconds(1)));
        assert!(l.should_retry_at("a", now + Duration::seconds(2)));
        assert_eq!(l.ready_for_retry_at(now + Duration::seconds(3)), vec!["a"]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let dir = TempDir::new().unwrap();
        let mut l = RetryLedger::new(
            dir.path(),
            RetryConfig {
                max_attempts: 20,
                backoff_base: 10.0,
                max_backoff_secs: 60,
            },
        );
        assert_eq!(l.backoff_for(5), Duration::seconds(60));

        let now = Utc::now();
        for _ in 0..5 {
            l.record_failure_at("a", "boom", now);
        }
        assert_eq!(l.get("a").unwrap().backoff_until, now + Duration::seconds(60));
    }

    #[test]
    fn test_unbounded_backoff_config_saturates() {
        let dir = TempDir::new().unwrap();
        let mut l = RetryLedger::new(
            dir.path(),
            RetryConfig {
                max_attempts: 100,
                backoff_base: 2.0,
                max_backoff_secs: u64::MAX,
            },
        );
        assert_eq!(
            l.backoff_for(80),
            Duration::seconds(MAX_BACKOFF_SECS as i64)
        );

        let now = Utc::now();
        let mut previous = now;
        for _ in 0..80 {
            l.record_failure_at("a", "boom", now);
            let until = l.get("a").unwrap().backoff_until;
            assert!(until >= previous);
            previous = until;
        }
        assert_eq!(l.get("a").unwrap().attempts, 80);
        assert_eq!(previous, now + Duration::seconds(MAX_BACKOFF_SECS as i64));
    }

    #[test]
    fn test_deadline_near_end_of_time_saturates() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 5);
        let late = DateTime::<Utc>::MAX_UTC - Duration::seconds(1);

        l.record_failure_at("a", "boom", late);
        assert_eq!(l.get("a").unwrap().backoff_until, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_backoff_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 10);
        let mut now = Utc::now();
        let mut previous = None;

        for _ in 0..8 {
            l.record_failure_at("a", "boom", now);
            let deadline = l.get("a").unwrap().backoff_until;
            if let Some(prev) = previous {
                assert!(deadline >= prev);
            }
            previous = Some(deadline);
            now += Duration::milliseconds(500);
        }
    }

    #[test]
    fn test_exhaustion_at_cap() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 3);
        let now = Utc::now();

        for _ in 0..5 {
            l.record_failure_at("a", "boom", now);
        }
        let record = l.get("a").unwrap();
        assert_eq!(record.attempts, 3);
        assert!(l.is_exhausted("a"));
        assert!(!l.should_retry_at("a", now + Duration::days(1)));
        assert!(l.ready_for_retry_at(now + Duration::days(1)).is_empty());
        assert_eq!(l.exhausted().len(), 1);
    }

    #[test]
    fn test_permanent_failure_exhausts_immediately() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 3);
        l.record_permanent_failure("bad", "invalid input");
        assert!(l.is_exhausted("bad"));
        assert_eq!(
            l.skip_reason_at("bad", Utc::now()),
            Some(SkipReason::Exhausted)
        );
    }

    #[test]
    fn test_success_deletes_record() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 3);
        l.record_failure("a", "boom");
        l.record_success("a");
        assert!(l.get("a").is_none());
        assert!(l.should_retry("a"));
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 2);
        let now = Utc::now();
        l.record_failure_at("backing-off", "x", now);
        l.record_failure_at("ready", "x", now - Duration::hours(1));
        l.record_failure_at("gone", "x", now);
        l.record_failure_at("gone", "x", now);

        let stats = l.stats_at(now);
        assert_eq!(
            stats,
            RetryStats {
                total: 3,
                exhausted: 1,
                in_backoff: 1,
                ready_for_retry: 1,
            }
        );
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 3);
        l.record_failure("a", "boom");
        l.record_permanent_failure("b", "bad");
        l.save().unwrap();

        let mut reloaded = ledger(dir.path(), 3);
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("a").unwrap().last_error.as_deref(), Some("boom"));
        assert!(reloaded.is_exhausted("b"));
    }

    #[test]
    fn test_lowered_cap_clamps_loaded_attempts() {
        let dir = TempDir::new().unwrap();
        let mut l = ledger(dir.path(), 5);
        let now = Utc::now();
        for _ in 0..4 {
            l.record_failure_at("a", "boom", now);
        }
        l.save().unwrap();

        let mut reloaded = ledger(dir.path(), 2);
        reloaded.load().unwrap();
        assert_eq!(reloaded.get("a").unwrap().attempts, 2);
        assert!(reloaded.is_exhausted("a"));
    }
}
