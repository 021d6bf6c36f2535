//! Unit processing.
//!
//! [`UnitProcessor`] leases an engine client from the pool, runs one work
//! unit through it under a size-adjusted timeout, and writes the unit's
//! output file. Every path yields a tagged [`UnitOutcome`]; nothing here
//! returns an error for a per-unit problem.

mod config;
mod output;
mod types;
mod unit;

pub use config::ProcessorConfig;
pub use output::{
    output_path_for, scan_output, scan_output_dir, OutputScan, OutputStatus, OutputWriter,
    OUTPUT_EXTENSION,
};
pub use types::{UnitError, UnitErrorKind, UnitOutcome};
pub use unit::UnitProcessor;
