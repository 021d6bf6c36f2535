//! Bounded pool of reusable engine clients.
//!
//! A counting semaphore of `max_instances` permits gates leases. Handles are
//! created lazily, reused through an idle queue, and replaced when they fail a
//! health check or come back broken. Only [`InstancePool`] owns handles; a
//! worker borrows one through a [`PooledInstance`] guard that returns it on
//! drop.

mod instance;
mod pool;

pub use instance::{HandleInfo, InstanceHandle, PooledInstance};
pub use pool::{default_max_instances, InstancePool, PoolError, PoolStatus};
