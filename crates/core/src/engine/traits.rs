//! Trait definitions for the engine module.

use async_trait::async_trait;
use std::time::Duration;

use super::error::EngineError;
use super::record::RecordSet;
use crate::discovery::WorkUnit;

/// A live connection to one engine instance.
///
/// Clients are leased to exactly one worker at a time, hence `&mut self`.
#[async_trait]
pub trait EngineClient: Send + 'static {
    /// Analyses the given units and returns one record set per unit.
    async fn parse(
        &mut self,
        units: &[WorkUnit],
        timeout: Duration,
    ) -> Result<Vec<RecordSet>, EngineError>;

    /// Cheap liveness check.
    async fn health_check(&mut self) -> bool;

    /// Releases the underlying process or connection.
    async fn shutdown(&mut self) {}
}

/// Constructs engine clients. Construction is expensive.
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    type Client: EngineClient;

    /// Returns the name of this engine implementation.
    fn name(&self) -> &str;

    /// Starts a new engine instance and connects to it.
    async fn create(&self) -> Result<Self::Client, EngineError>;
}
