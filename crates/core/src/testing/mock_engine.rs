//! Mock engine for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::discovery::WorkUnit;
use crate::engine::{EngineClient, EngineError, EngineFactory, Record, RecordSet};

/// Configured behaviour plus observations shared by the factory and every
/// client it creates.
#[derive(Debug, Default)]
struct MockState {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    /// Remaining transient failures per unit.
    transient: HashMap<String, u32>,
    always_fail: HashSet<String>,
    invalid: HashSet<String>,
    hang: HashSet<String>,
    records_per_unit: usize,
    /// Unit id reported back instead of the requested one.
    answer_as: HashMap<String, String>,

    create_delay: Duration,
    health_delay: Duration,
    create_failures: u32,
    create_always_fails: bool,
    health_failures: u32,

    created: usize,
    live: usize,
    in_flight: HashSet<String>,
    concurrent: usize,
    max_concurrent: usize,
    duplicate_in_flight: usize,
    parse_calls: HashMap<String, u32>,
}

/// Mock implementation of [`EngineFactory`].
///
/// Provides controllable behavior for testing:
/// - Per-unit delays, transient and permanent failures, hangs
/// - Construction failures and failing health checks
/// - Tracks in-flight units, peak concurrency and parse counts
///
/// Clones share state, so keep a clone for assertions after handing the factory
/// to a pool.
///
/// # Example
///
/// ```rust,ignore
/// use docbatch_core::testing::MockEngineFactory;
///
/// let factory = MockEngineFactory::new();
/// factory.fail_transiently("a.pdf", 1);
/// let engines = factory.clone();
/// let pool = InstancePool::new(factory, 2);
/// // ...
/// assert_eq!(engines.parse_count("a.pdf"), 2);
/// ```
#[derive(Debug, Clone)]
pub struct MockEngineFactory {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngineFactory {
    /// Create a new mock factory whose clients succeed instantly.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                records_per_unit: 1,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Set the simulated parse time for every unit.
    pub fn set_default_delay(&self, delay: Duration) {
        self.lock().default_delay = delay;
    }

    /// Set the simulated parse time for one unit.
    pub fn set_delay(&self, unit_id: &str, delay: Duration) {
        self.lock().delays.insert(unit_id.to_string(), delay);
    }

    /// Fail the next `times` parses of a unit with a retryable error.
    pub fn fail_transiently(&self, unit_id: &str, times: u32) {
        self.lock().transient.insert(unit_id.to_string(), times);
    }

    /// Fail every parse of a unit with a retryable error.
    pub fn fail_always(&self, unit_id: &str) {
        self.lock().always_fail.insert(unit_id.to_string());
    }

    /// Reject a unit as invalid input.
    pub fn reject_as_invalid(&self, unit_id: &str) {
        self.lock().invalid.insert(unit_id.to_string());
    }

    /// Make parsing a unit never finish on its own.
    pub fn hang_on(&self, unit_id: &str) {
        self.lock().hang.insert(unit_id.to_string());
    }

    /// Answer parses of `unit_id` with records labelled as `reply_id`.
    pub fn answer_as(&self, unit_id: &str, reply_id: &str) {
        self.lock()
            .answer_as
            .insert(unit_id.to_string(), reply_id.to_string());
    }

    /// Number of records emitted per unit.
    pub fn set_records_per_unit(&self, count: usize) {
        self.lock().records_per_unit = count;
    }

    /// Make every client construction take `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = delay;
    }

    /// Make every health check take `delay`.
    pub fn set_health_delay(&self, delay: Duration) {
        self.lock().health_delay = delay;
    }

    /// Fail the next `times` client constructions.
    pub fn fail_creates(&self, times: u32) {
        self.lock().create_failures = times;
    }

    /// Fail every client construction.
    pub fn fail_all_creates(&self) {
        self.lock().create_always_fails = true;
    }

    /// Fail the next `times` health checks.
    pub fn fail_health_checks(&self, times: u32) {
        self.lock().health_failures = times;
    }

    /// Clients constructed so far.
    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    /// Clients constructed and not yet shut down or dropped.
    pub fn live_count(&self) -> usize {
        self.lock().live
    }

    /// Highest number of units parsed at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_concurrent
    }

    /// Times a unit was handed to the engine while already in flight.
    pub fn duplicate_in_flight(&self) -> usize {
        self.lock().duplicate_in_flight
    }

    /// Times a unit was handed to the engine.
    pub fn parse_count(&self, unit_id: &str) -> u32 {
        self.lock().parse_calls.get(unit_id).copied().unwrap_or(0)
    }

    /// Total parse calls across all units.
    pub fn total_parses(&self) -> u32 {
        self.lock().parse_calls.values().sum()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    type Client = MockEngine;

    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self) -> Result<MockEngine, EngineError> {
        let delay = self.lock().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.create_always_fails || state.create_failures > 0 {
            state.create_failures = state.create_failures.saturating_sub(1);
            return Err(EngineError::SpawnFailed {
                path: "mock".into(),
                reason: "mock construction failure".to_string(),
            });
        }
        state.created += 1;
        state.live += 1;
        Ok(MockEngine {
            state: Arc::clone(&self.state),
            alive: true,
        })
    }
}

/// Client produced by [`MockEngineFactory`].
#[derive(Debug)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    alive: bool,
}

enum Planned {
    /// Records per unit, then the unit id each answer is labelled with.
    Succeed(usize, Vec<String>),
    Fail(EngineError),
    Hang,
}

impl MockEngine {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn begin(&self, units: &[WorkUnit]) -> (Duration, Planned) {
        let mut state = self.lock();
        let mut delay = Duration::ZERO;
        let reply_ids = units
            .iter()
            .map(|u| state.answer_as.get(&u.id).cloned().unwrap_or_else(|| u.id.clone()))
            .collect();
        let mut planned = Planned::Succeed(state.records_per_unit, reply_ids);

        for unit in units {
            *state.parse_calls.entry(unit.id.clone()).or_insert(0) += 1;
            if !state.in_flight.insert(unit.id.clone()) {
                state.duplicate_in_flight += 1;
            }
            delay = delay.max(
                state
                    .delays
                    .get(&unit.id)
                    .copied()
                    .unwrap_or(state.default_delay),
            );

            if matches!(planned, Planned::Succeed(..)) {
                if state.invalid.contains(&unit.id) {
                    planned = Planned::Fail(EngineError::invalid_input(
                        &unit.id,
                        "mock rejects this document",
                    ));
                } else if state.hang.contains(&unit.id) {
                    planned = Planned::Hang;
                } else if state.always_fail.contains(&unit.id) {
                    planned =
                        Planned::Fail(EngineError::Reported(format!("mock failure on {}", unit.id)));
                } else if let Some(left) = state.transient.get_mut(&unit.id) {
                    if *left > 0 {
                        *left -= 1;
                        planned = Planned::Fail(EngineError::Reported(format!(
                            "mock transient failure on {}",
                            unit.id
                        )));
                    }
                }
            }
        }

        state.concurrent += units.len();
        state.max_concurrent = state.max_concurrent.max(state.concurrent);
        (delay, planned)
    }

    fn finish(&self, units: &[WorkUnit]) {
        let mut state = self.lock();
        for unit in units {
            state.in_flight.remove(&unit.id);
        }
        state.concurrent -= units.len();
    }
}

/// Removes units from the in-flight set even when the parse future is
/// dropped by an outer timeout or cancellation.
struct InFlight<'a> {
    engine: &'a MockEngine,
    units: &'a [WorkUnit],
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.engine.finish(self.units);
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn parse(
        &mut self,
        units: &[WorkUnit],
        timeout: Duration,
    ) -> Result<Vec<RecordSet>, EngineError> {
        let (delay, planned) = self.begin(units);
        let _guard = InFlight {
            engine: self,
            units,
        };

        let wait = match planned {
            Planned::Hang => timeout,
            _ => delay,
        };
        if wait >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(EngineError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(wait).await;

        match planned {
            Planned::Succeed(count, reply_ids) => Ok(units
                .iter()
                .zip(reply_ids)
                .map(|(unit, unit_id)| {
                    let records = (0..count)
                        .map(|i| Record::text(format!("{} record {}", unit.id, i)))
                        .collect();
                    RecordSet { unit_id, records }
                })
                .collect()),
            Planned::Fail(e) => Err(e),
            Planned::Hang => unreachable!("hang always waits out the timeout"),
        }
    }

    async fn health_check(&mut self) -> bool {
        let delay = self.lock().health_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.health_failures > 0 {
            state.health_failures -= 1;
            return false;
        }
        self.alive
    }

    async fn shutdown(&mut self) {
        if self.alive {
            self.alive = false;
            self.lock().live -= 1;
        }
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        if self.alive {
            self.alive = false;
            if let Ok(mut state) = self.state.lock() {
                state.live -= 1;
            }
        }
    }
}
