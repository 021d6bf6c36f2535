//! Instance pool implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::instance::{HandleInfo, InstanceHandle, PooledInstance};
use crate::engine::{EngineClient, EngineError, EngineFactory};
use crate::metrics;
use crate::resources::ResourceSnapshot;

/// Error type for pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No instance became free in time.
    #[error("no engine instance available after {waited_ms} ms")]
    AcquireTimeout { waited_ms: u64 },

    /// The pool has been shut down.
    #[error("instance pool is shut down")]
    Closed,

    /// Constructing a new instance failed.
    #[error("failed to create engine instance: {0}")]
    Engine(#[from] EngineError),
}

/// Pool size derived from the host: memory is normally the binding
/// constraint since every instance wraps a heavyweight process.
pub fn default_max_instances(
    snapshot: &ResourceSnapshot,
    per_instance_memory_gb: f64,
    worker_cap: usize,
) -> usize {
    let by_memory = if per_instance_memory_gb > 0.0 {
        (snapshot.available_gb() / per_instance_memory_gb).floor() as usize
    } else {
        worker_cap
    };
    by_memory.min(worker_cap).min(snapshot.cpu_count).max(1)
}

/// Current pool status.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub max_instances: usize,
    /// Live handles (idle + leased + being checked).
    pub created: usize,
    pub idle: usize,
    pub leased: usize,
    pub total_leases: u64,
    pub acquire_timeouts: u64,
    pub replaced: u64,
    pub handles: Vec<HandleInfo>,
}

struct PoolInner<C> {
    idle: VecDeque<InstanceHandle<C>>,
    leased: HashMap<u64, HandleInfo>,
    created: usize,
    closed: bool,
}

/// State shared between the pool and its outstanding leases.
pub(crate) struct Shared<C> {
    inner: Mutex<PoolInner<C>>,
    total_leases: AtomicU64,
    acquire_timeouts: AtomicU64,
    replaced: AtomicU64,
}

impl<C: EngineClient> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolInner<C>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Return a handle from a lease.
    pub(crate) fn give_back(&self, handle: InstanceHandle<C>, broken: bool) {
        let mut inner = self.lock();
        inner.leased.remove(&handle.id);

        if broken || inner.closed {
            inner.created -= 1;
            metrics::POOL_INSTANCES.set(inner.created as i64);
            drop(inner);
            if broken {
                info!(handle = handle.id, "Discarding broken engine instance");
            }
            retire(handle);
        } else {
            inner.idle.push_back(handle);
        }
    }
}

/// Reserves one `created` slot while a client is constructed. The slot is
/// released on drop unless [`keep`](Self::keep) was called, so a failed or
/// cancelled construction never leaks capacity.
struct CreateSlot<'a, C: EngineClient> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<'a, C: EngineClient> CreateSlot<'a, C> {
    fn new(shared: &'a Shared<C>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<C: EngineClient> Drop for CreateSlot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.shared.lock();
            inner.created -= 1;
            metrics::POOL_INSTANCES.set(inner.created as i64);
        }
    }
}

/// Shut a client down in the background. Drop cannot await.
fn retire<C: EngineClient>(handle: InstanceHandle<C>) {
    let mut client = handle.client;
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                client.shutdown().await;
            });
        }
        Err(_) => drop(client),
    }
}

/// Bounded pool of engine clients.
pub struct InstancePool<F: EngineFactory> {
    factory: Arc<F>,
    max_instances: usize,
    semaphore: Arc<Semaphore>,
    shared: Arc<Shared<F::Client>>,
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl<F: EngineFactory> InstancePool<F> {
    /// Creates a pool that will hold at most `max_instances` clients.
    pub fn new(factory: F, max_instances: usize) -> Self {
        let max_instances = max_instances.max(1);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            factory: Arc::new(factory),
            max_instances,
            semaphore: Arc::new(Semaphore::new(max_instances)),
            shared: Arc::new(Shared {
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::new(),
                    leased: HashMap::new(),
                    created: 0,
                    closed: false,
                }),
                total_leases: AtomicU64::new(0),
                acquire_timeouts: AtomicU64::new(0),
                replaced: AtomicU64::new(0),
            }),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Lease a client, waiting up to `timeout` for one to become free.
    ///
    /// Reuses an idle client when there is one, otherwise constructs a new one.
    /// Construction errors are returned as-is; the pool does not retry them.
    pub async fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<PooledInstance<F::Client>, PoolError> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.shared.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::POOL_ACQUIRE_TIMEOUTS.inc();
                return Err(PoolError::AcquireTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        // Every handle outside the idle queue is covered by a permit, so with
        // our permit in hand and nothing idle there is always room to create.
        let idle = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(PoolError::Closed);
            }
            match inner.idle.pop_front() {
                Some(handle) => Some(handle),
                None => {
                    debug_assert!(inner.created < self.max_instances);
                    inner.created += 1;
                    None
                }
            }
        };

        let handle = match idle {
            Some(handle) => handle,
            None => {
                // Dropping this future mid-construction releases the slot.
                let slot = CreateSlot::new(&self.shared);
                match self.factory.create().await {
                    Ok(client) => {
                        slot.keep();
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let created = self.shared.lock().created;
                        metrics::POOL_INSTANCES.set(created as i64);
                        debug!(handle = id, created, "Created engine instance");
                        InstanceHandle::new(id, client)
                    }
                    Err(e) => {
                        drop(slot);
                        warn!("Failed to create engine instance: {}", e);
                        return Err(PoolError::Engine(e));
                    }
                }
            }
        };

        self.shared.total_leases.fetch_add(1, Ordering::Relaxed);
        self.shared
            .lock()
            .leased
            .insert(handle.id, handle.info(true));

        Ok(PooledInstance::new(handle, Arc::clone(&self.shared), permit))
    }

    /// Return a lease explicitly. Equivalent to dropping it.
    pub fn release(&self, lease: PooledInstance<F::Client>) {
        drop(lease);
    }

    /// Make sure at least one instance can be started.
    pub async fn warm_up(&self, timeout: Duration) -> Result<(), PoolError> {
        let lease = self.acquire(timeout).await?;
        self.release(lease);
        Ok(())
    }

    /// Ping every idle client, destroy the ones that fail and start
    /// replacements. Returns the number of replaced clients.
    pub async fn health_check(&self) -> usize {
        let to_check = self.shared.lock().idle.len();
        let mut replaced = 0;

        for _ in 0..to_check {
            // Hold a permit while a handle is out of the idle queue.
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let Some(mut handle) = self.shared.lock().idle.pop_front() else {
                break;
            };

            if handle.client.health_check().await {
                // Retired instead of requeued if the pool closed meanwhile.
                self.shared.give_back(handle, false);
                drop(permit);
                continue;
            }

            let old_id = handle.id;
            handle.client.shutdown().await;
            drop(handle);

            // The old handle's slot carries over to its replacement.
            let slot = CreateSlot::new(&self.shared);
            if self.shared.lock().closed {
                debug!(old = old_id, "Pool closed, not replacing unhealthy instance");
                break;
            }
            match self.factory.create().await {
                Ok(client) => {
                    slot.keep();
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    info!(old = old_id, new = id, "Replaced unhealthy engine instance");
                    self.shared.give_back(InstanceHandle::new(id, client), false);
                }
                Err(e) => {
                    warn!(
                        old = old_id,
                        "Unhealthy engine instance removed, replacement failed: {}", e
                    );
                }
            }

            self.shared.replaced.fetch_add(1, Ordering::Relaxed);
            metrics::POOL_REPLACEMENTS.inc();
            replaced += 1;
            drop(permit);
        }

        replaced
    }

    /// Spawn the periodic health checker. It stops on [`shutdown`](Self::shutdown).
    pub fn spawn_health_checker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!("Pool health checker started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        let replaced = pool.health_check().await;
                        if replaced > 0 {
                            info!("Pool health check replaced {} instance(s)", replaced);
                        }
                    }
                }
            }
            debug!("Pool health checker stopped");
        })
    }

    /// Close the pool: pending and future acquires fail, idle clients are shut
    /// down, leased clients are shut down when returned.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let _ = self.shutdown_tx.send(());

        let idle: Vec<_> = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let idle: Vec<_> = inner.idle.drain(..).collect();
            inner.created -= idle.len();
            metrics::POOL_INSTANCES.set(inner.created as i64);
            idle
        };

        let count = idle.len();
        for mut handle in idle {
            handle.client.shutdown().await;
        }
        info!("Instance pool shut down ({} idle instance(s) stopped)", count);
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        let inner = self.shared.lock();
        let mut handles: Vec<HandleInfo> = inner.idle.iter().map(|h| h.info(false)).collect();
        handles.extend(inner.leased.values().cloned());
        handles.sort_by_key(|h| h.id);

        PoolStatus {
            max_instances: self.max_instances,
            created: inner.created,
            idle: inner.idle.len(),
            leased: inner.leased.len(),
            total_leases: self.shared.total_leases.load(Ordering::Relaxed),
            acquire_timeouts: self.shared.acquire_timeouts.load(Ordering::Relaxed),
            replaced: self.shared.replaced.load(Ordering::Relaxed),
            handles,
        }
    }
}
