//! External text-analysis engine abstraction.
//!
//! Engine clients are expensive to construct (each one owns a process), so
//! they are created through an [`EngineFactory`] and pooled by
//! [`crate::pool::InstancePool`]. Output from the engine is mapped into the
//! fixed [`Record`] struct at this boundary.

mod error;
mod process;
mod record;
mod traits;

pub use error::EngineError;
pub use process::{ProcessEngine, ProcessEngineFactory};
pub use record::{map_record, map_record_set, Record, RecordSet, Span, RECORD_SCHEMA_VERSION};
pub use traits::{EngineClient, EngineFactory};
