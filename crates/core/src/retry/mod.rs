//! Per-unit retry bookkeeping with exponential backoff.

mod ledger;

pub use ledger::{RetryLedger, RetryRecord, RetryStats, MAX_BACKOFF_SECS, RETRY_LEDGER_FILE};
