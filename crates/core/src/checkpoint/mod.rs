//! Durable record of which units a batch has already handled.

mod store;

pub use store::{CheckpointError, CheckpointState, CheckpointStore, CHECKPOINT_FILE};
