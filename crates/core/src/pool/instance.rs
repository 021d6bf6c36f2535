//! Pooled engine handles and the lease guard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;

use super::pool::Shared;
use crate::engine::EngineClient;

/// An engine client plus its usage bookkeeping.
pub struct InstanceHandle<C> {
    pub(crate) id: u64,
    pub(crate) client: C,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) use_count: u64,
    pub(crate) cumulative_busy: Duration,
}

impl<C> InstanceHandle<C> {
    pub(crate) fn new(id: u64, client: C) -> Self {
        Self {
            id,
            client,
            created_at: Utc::now(),
            use_count: 0,
            cumulative_busy: Duration::ZERO,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn info(&self, busy: bool) -> HandleInfo {
        HandleInfo {
            id: self.id,
            busy,
            created_at: self.created_at,
            use_count: self.use_count,
            cumulative_busy_ms: self.cumulative_busy.as_millis() as u64,
        }
    }
}

/// Snapshot of one handle for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: u64,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
    pub use_count: u64,
    pub cumulative_busy_ms: u64,
}

/// A leased engine client.
///
/// Dropping the lease returns the handle to the idle queue, or destroys it if
/// [`mark_broken`](Self::mark_broken) was called. The semaphore permit is
/// released only after the handle is back, so a waiter woken by the permit
/// always finds either an idle handle or a free creation slot.
pub struct PooledInstance<C: EngineClient> {
    handle: Option<InstanceHandle<C>>,
    shared: Arc<Shared<C>>,
    leased_at: Instant,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: EngineClient> PooledInstance<C> {
    pub(crate) fn new(
        handle: InstanceHandle<C>,
        shared: Arc<Shared<C>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            handle: Some(handle),
            shared,
            leased_at: Instant::now(),
            broken: false,
            _permit: permit,
        }
    }

    /// Id of the leased handle.
    pub fn id(&self) -> u64 {
        self.handle.as_ref().map(|h| h.id).unwrap_or_default()
    }

    /// The engine client.
    pub fn client(&mut self) -> &mut C {
        // The handle is only taken in Drop.
        &mut self
            .handle
            .as_mut()
            .expect("lease holds a handle until dropped")
            .client
    }

    /// Flag the client as unusable; it is destroyed instead of requeued.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<C: EngineClient> Drop for PooledInstance<C> {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.use_count += 1;
            handle.cumulative_busy += self.leased_at.elapsed();
            self.shared.give_back(handle, self.broken);
        }
    }
}
