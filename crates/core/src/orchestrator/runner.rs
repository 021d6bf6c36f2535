//! Batch orchestrator implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::OrchestratorConfig;
use super::types::{
    BatchProgress, BatchSummary, CancelHandle, ChunkResult, OrchestratorError, ProgressCallback,
    RunOutcome,
};
use crate::checkpoint::CheckpointStore;
use crate::discovery::{discover_units, DiscoveryStats, SkipReason, UnitQueue, WorkUnit};
use crate::engine::EngineFactory;
use crate::job::{JobError, JobRegistry, JobStatus, ProgressDelta};
use crate::metrics;
use crate::processor::{UnitOutcome, UnitProcessor};
use crate::resources::ResourceSnapshot;
use crate::retry::RetryLedger;
use crate::scaler::AdaptiveScaler;

/// How often a paused job is re-checked.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Chunk size for the next chunk: halved under memory pressure.
pub fn chunk_size_for(snapshot: &ResourceSnapshot, configured: usize, threshold: f64) -> usize {
    let configured = configured.max(1);
    if snapshot.memory_utilization() > threshold {
        (configured / 2).max(1)
    } else {
        configured
    }
}

/// Mutable bookkeeping of one run.
#[derive(Default)]
struct RunState {
    total: usize,
    successful: usize,
    /// Units whose latest attempt failed.
    failed_ids: HashSet<String>,
    /// Units waiting for a free engine instance.
    deferred: Vec<WorkUnit>,
    /// Every unit dispatched in this run, for the retry phase.
    known: HashMap<String, WorkUnit>,
    chunks: usize,
    workers: usize,
    worker_cap: usize,
    discovery: DiscoveryStats,
}

impl RunState {
    fn progress(&self, last_chunk: ChunkResult) -> BatchProgress {
        let done = self.successful + self.failed_ids.len();
        BatchProgress {
            total: self.total,
            successful: self.successful,
            failed: self.failed_ids.len(),
            deferred: self.deferred.len(),
            chunks: self.chunks,
            workers: self.workers,
            last_chunk,
            percentage: if self.total == 0 {
                100.0
            } else {
                (done as f64 / self.total as f64 * 100.0).min(100.0)
            },
        }
    }
}

/// Top-level batch driver.
///
/// Owns the checkpoint, the retry ledger and the active job's progress. All
/// three are mutated only here, between chunk dispatches.
pub struct BatchOrchestrator<F: EngineFactory> {
    config: OrchestratorConfig,
    processor: Arc<UnitProcessor<F>>,
    scaler: AdaptiveScaler,
    checkpoint: CheckpointStore,
    ledger: RetryLedger,
    job: Option<(Arc<JobRegistry>, String)>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    state_loaded: bool,
}

impl<F: EngineFactory> BatchOrchestrator<F> {
    /// Create an orchestrator. State is not read until [`run`](Self::run).
    pub fn new(
        config: OrchestratorConfig,
        processor: Arc<UnitProcessor<F>>,
        scaler: AdaptiveScaler,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            checkpoint: CheckpointStore::new(&config.checkpoint_dir),
            ledger: RetryLedger::new(&config.checkpoint_dir, config.retry.clone()),
            config,
            processor,
            scaler,
            job: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            state_loaded: false,
        }
    }

    /// Report lifecycle and progress to a registered job.
    pub fn with_job(mut self, registry: Arc<JobRegistry>, job_id: impl Into<String>) -> Self {
        self.job = Some((registry, job_id.into()));
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.cancel_tx))
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Run the batch to completion, abort or cancellation.
    ///
    /// State is persisted, the job finalised and the pool shut down on every
    /// path, including errors.
    pub async fn run(
        &mut self,
        progress: Option<ProgressCallback>,
    ) -> Result<BatchSummary, OrchestratorError> {
        let started = Instant::now();
        self.attach_job()?;

        let mut state = RunState::default();
        let result = self.execute(&mut state, progress.as_ref()).await;

        let persisted = self.persist();
        self.processor.pool().shutdown().await;

        let result = match (result, persisted) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), persisted) => {
                if let Err(pe) = persisted {
                    error!("Failed to persist state after error: {}", pe);
                }
                Err(e)
            }
        };
        self.finish_job(&result).await;
        let outcome = result?;

        let duration_secs = started.elapsed().as_secs_f64();
        let deferred: HashSet<&str> = state.deferred.iter().map(|u| u.id.as_str()).collect();
        let summary = BatchSummary {
            job_id: self.job.as_ref().map(|(_, id)| id.clone()),
            total: state.total,
            successful: state.successful,
            failed: state.failed_ids.len(),
            deferred: deferred.len(),
            skipped: state.discovery.seen.saturating_sub(state.discovery.queued),
            duration_secs,
            throughput: if duration_secs > 0.0 {
                state.successful as f64 / duration_secs
            } else {
                0.0
            },
            outcome,
            discovery: state.discovery.clone(),
            retry: self.ledger.stats(),
        };
        self.log_summary(&summary);
        Ok(summary)
    }

    fn attach_job(&self) -> Result<(), OrchestratorError> {
        let Some((registry, job_id)) = &self.job else {
            return Ok(());
        };
        let pid = std::process::id();
        let job = registry
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.clone()))?;

        match job.status {
            JobStatus::Queued => registry.start(job_id, pid)?,
            JobStatus::Running if job.owner_pid == Some(pid) => {}
            status => {
                return Err(JobError::InvalidTransition {
                    job_id: job_id.clone(),
                    status,
                    operation: "run",
                }
                .into())
            }
        }
        Ok(())
    }

    async fn finish_job(&self, result: &Result<RunOutcome, OrchestratorError>) {
        let Some((registry, job_id)) = &self.job else {
            return;
        };

        let finished = match result {
            Ok(RunOutcome::Cancelled) => registry.cancel(job_id).await.map(|_| ()),
            Ok(outcome) => registry.complete(job_id, outcome.job_error()).map(|_| ()),
            Err(e) => registry.complete(job_id, Some(e.to_string())).map(|_| ()),
        };
        match finished {
            Ok(()) => {}
            Err(JobError::InvalidTransition { status, .. }) => {
                debug!(job_id = %job_id, %status, "Job already finalised elsewhere");
            }
            Err(e) => warn!(job_id = %job_id, "Failed to finalise job: {}", e),
        }
    }

    fn persist(&mut self) -> Result<(), OrchestratorError> {
        if !self.state_loaded {
            return Ok(());
        }
        self.checkpoint.save()?;
        self.ledger.save()?;
        Ok(())
    }

    async fn execute(
        &mut self,
        state: &mut RunState,
        progress: Option<&ProgressCallback>,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.checkpoint.load()?;
        self.ledger.load()?;
        self.state_loaded = true;

        let now = Utc::now();
        let checkpoint = &self.checkpoint;
        let ledger = &self.ledger;
        let (mut queue, stats) =
            discover_units(&self.config.input_dir, &self.config.discovery, |id| {
                if checkpoint.is_processed(id) {
                    Some(SkipReason::Processed)
                } else {
                    ledger.skip_reason_at(id, now)
                }
            })
            .map_err(|source| OrchestratorError::Discovery {
                path: self.config.input_dir.clone(),
                source,
            })?;

        info!(
            queued = stats.queued,
            already_processed = stats.already_processed,
            exhausted = stats.exhausted,
            backing_off = stats.backing_off,
            empty = stats.empty,
            oversized = stats.oversized,
            wrong_extension = stats.wrong_extension,
            "Discovered {} file(s) in {}",
            stats.seen,
            self.config.input_dir.display()
        );
        state.total = queue.remaining();
        state.discovery = stats;
        self.set_job_total(state.total as u64);

        if queue.is_empty() {
            info!("Nothing to process");
            return Ok(RunOutcome::Completed);
        }

        let pool = Arc::clone(self.processor.pool());
        if let Err(e) = pool.warm_up(self.config.warm_up_timeout).await {
            error!("Engine warm-up failed: {}", e);
            return Err(OrchestratorError::EngineUnavailable(e.to_string()));
        }
        let _health_checker = pool.spawn_health_checker(self.config.pool_health_check_interval);

        state.worker_cap = self.config.max_workers.min(pool.max_instances()).max(1);
        state.workers = self.scaler.optimal_workers().min(state.worker_cap);
        info!(
            workers = state.workers,
            instances = pool.max_instances(),
            "Starting batch of {} unit(s)",
            state.total
        );

        let mut last_health = Instant::now();
        while !queue.is_empty() {
            if let Some(outcome) = self.check_interrupt().await {
                return Ok(outcome);
            }

            let snapshot = self.scaler.sample();
            if last_health.elapsed() >= self.config.health_check_interval {
                let status = pool.status();
                info!(
                    idle = status.idle,
                    leased = status.leased,
                    replaced = status.replaced,
                    "Resource check: {}",
                    snapshot.to_log_string()
                );
                last_health = Instant::now();
            }

            let size = chunk_size_for(
                &snapshot,
                self.config.chunk_size,
                self.config.memory_pressure_threshold,
            );
            if size < self.config.chunk_size {
                info!(
                    chunk_size = size,
                    memory_used_pct = snapshot.memory_utilization() * 100.0,
                    "Memory pressure, shrinking chunk"
                );
            }
            if state.chunks > 0 {
                state.workers = self.scaler.adjust(state.workers).min(state.worker_cap);
            }

            let units = queue.next_chunk(size);
            let (chunk, unlaunched) = self.run_chunk(units, state, progress).await?;
            if !unlaunched.is_empty() {
                info!("Cancelled with {} unit(s) of the chunk not started", unlaunched.len());
                return Ok(RunOutcome::Cancelled);
            }

            if chunk.failure_rate() > self.config.failure_rate_threshold {
                let reason = format!(
                    "{} of {} units in chunk {} failed (threshold {:.0}%)",
                    chunk.failed,
                    chunk.chunk_size,
                    state.chunks,
                    self.config.failure_rate_threshold * 100.0
                );
                error!("Aborting batch: {}", reason);
                return Ok(RunOutcome::Aborted { reason });
            }
        }

        if let Some(outcome) = self.retry_phase(state, progress).await? {
            return Ok(outcome);
        }

        let failed = state.failed_ids.len();
        if failed > 0 && failed as f64 / state.total as f64 > self.config.failure_rate_threshold
        {
            return Ok(RunOutcome::TooManyFailures {
                failed,
                total: state.total,
            });
        }
        Ok(RunOutcome::Completed)
    }

    /// Re-dispatch transiently failed and deferred units while their backoff
    /// expires within the wait limit. Returns an outcome only when interrupted.
    async fn retry_phase(
        &mut self,
        state: &mut RunState,
        progress: Option<&ProgressCallback>,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let max_rounds = self.config.retry.max_attempts as usize + 1;
        let mut rounds = 0;
        let mut waits = 0;

        while rounds < max_rounds && waits <= max_rounds {
            if let Some(outcome) = self.check_interrupt().await {
                return Ok(Some(outcome));
            }

            let mut seen = HashSet::new();
            let mut candidates: Vec<WorkUnit> = std::mem::take(&mut state.deferred)
                .into_iter()
                .filter(|u| seen.insert(u.id.clone()))
                .collect();
            for id in self.ledger.ready_for_retry() {
                if !state.failed_ids.contains(&id) || seen.contains(&id) {
                    continue;
                }
                if let Some(unit) = state.known.get(&id) {
                    seen.insert(id);
                    candidates.push(unit.clone());
                }
            }

            if candidates.is_empty() {
                let next = state
                    .failed_ids
                    .iter()
                    .filter(|id| !self.ledger.is_exhausted(id))
                    .filter_map(|id| self.ledger.get(id))
                    .map(|r| r.backoff_until)
                    .min();
                let Some(next) = next else {
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if wait > self.config.retry_wait_limit {
                    info!(
                        wait_secs = wait.as_secs(),
                        "Next retry is beyond the wait limit, leaving it for a later run"
                    );
                    break;
                }
                debug!(wait_ms = wait.as_millis() as u64, "Waiting for retry backoff");
                if self.sleep_or_cancel(wait).await {
                    return Ok(Some(RunOutcome::Cancelled));
                }
                waits += 1;
                continue;
            }

            rounds += 1;
            info!(round = rounds, "Retrying {} unit(s)", candidates.len());
            metrics::RETRIES_TOTAL.inc_by(candidates.len() as u64);

            let mut queue = UnitQueue::from_units(candidates);
            while !queue.is_empty() {
                if let Some(outcome) = self.check_interrupt().await {
                    return Ok(Some(outcome));
                }
                state.workers = self.scaler.adjust(state.workers).min(state.worker_cap);
                let units = queue.next_chunk(self.config.chunk_size);
                let (_, unlaunched) = self.run_chunk(units, state, progress).await?;
                if !unlaunched.is_empty() {
                    return Ok(Some(RunOutcome::Cancelled));
                }
            }
        }
        Ok(None)
    }

    /// Dispatch one chunk with `state.workers` concurrent workers and fold
    /// the outcomes. Returns units that were never started because the run
    /// was cancelled.
    async fn run_chunk(
        &mut self,
        units: Vec<WorkUnit>,
        state: &mut RunState,
        progress: Option<&ProgressCallback>,
    ) -> Result<(ChunkResult, Vec<WorkUnit>), OrchestratorError> {
        let chunk_started = Instant::now();
        let workers = state.workers.max(1);
        metrics::CHUNKS_TOTAL.inc();
        metrics::WORKERS.set(workers as i64);

        for unit in &units {
            state.known.insert(unit.id.clone(), unit.clone());
        }

        let processor = Arc::clone(&self.processor);
        let cancel = self.cancel_rx.clone();
        let results: Vec<(WorkUnit, Option<UnitOutcome>)> = stream::iter(units)
            .map(|unit| {
                let processor = Arc::clone(&processor);
                let cancel = cancel.clone();
                async move {
                    if *cancel.borrow() {
                        return (unit, None);
                    }
                    let outcome = processor.process(&unit).await;
                    (unit, Some(outcome))
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut chunk = ChunkResult::default();
        let mut delta = ProgressDelta::default();
        let mut unlaunched = Vec::new();
        for (unit, outcome) in results {
            match outcome {
                Some(outcome) => {
                    chunk.chunk_size += 1;
                    self.fold_outcome(unit, &outcome, state, &mut chunk, &mut delta);
                }
                None => unlaunched.push(unit),
            }
        }

        let elapsed = chunk_started.elapsed().as_secs_f64();
        self.scaler
            .record_throughput(chunk.processed + chunk.failed, elapsed);
        if chunk.deferred > 0 {
            state.workers = self.scaler.back_off(state.workers);
        }

        self.persist()?;
        self.update_job_progress(delta);
        state.chunks += 1;

        info!(
            chunk = state.chunks,
            processed = chunk.processed,
            failed = chunk.failed,
            deferred = chunk.deferred,
            workers,
            elapsed_secs = elapsed,
            "Chunk finished"
        );
        if let Some(callback) = progress {
            callback(&state.progress(chunk));
        }
        Ok((chunk, unlaunched))
    }

    fn fold_outcome(
        &mut self,
        unit: WorkUnit,
        outcome: &UnitOutcome,
        state: &mut RunState,
        chunk: &mut ChunkResult,
        delta: &mut ProgressDelta,
    ) {
        let id = unit.id.as_str();

        if outcome.is_success() {
            self.checkpoint.mark_processed(id);
            self.ledger.record_success(id);
            chunk.processed += 1;
            state.successful += 1;
            delta.processed += 1;
            if state.failed_ids.remove(id) {
                delta.failed -= 1;
            }
            return;
        }

        if outcome.is_deferred() {
            chunk.deferred += 1;
            state.deferred.push(unit);
            return;
        }

        let message = outcome.error_message().unwrap_or_default();
        if outcome.is_permanent_failure() {
            self.ledger.record_permanent_failure(id, &message);
        } else {
            self.ledger.record_failure(id, &message);
        }
        self.checkpoint.mark_failed(id);
        chunk.failed += 1;
        if state.failed_ids.insert(unit.id.clone()) {
            delta.failed += 1;
        }
    }

    /// Outcome to stop with, if the run was cancelled locally or through the
    /// job registry. Blocks while the job is paused.
    async fn check_interrupt(&self) -> Option<RunOutcome> {
        if *self.cancel_rx.borrow() {
            info!("Cancellation requested, stopping");
            return Some(RunOutcome::Cancelled);
        }
        let (registry, job_id) = self.job.as_ref()?;

        let mut announced = false;
        loop {
            let status = match registry.get(job_id) {
                Ok(Some(job)) => job.status,
                Ok(None) => return None,
                Err(e) => {
                    warn!(job_id = %job_id, "Cannot read job status: {}", e);
                    return None;
                }
            };
            match status {
                JobStatus::Cancelled => {
                    info!(job_id = %job_id, "Job cancelled through the registry, stopping");
                    return Some(RunOutcome::Cancelled);
                }
                JobStatus::Paused => {
                    if !announced {
                        info!(job_id = %job_id, "Job paused, waiting for resume");
                        announced = true;
                    }
                    if self.sleep_or_cancel(PAUSE_POLL_INTERVAL).await {
                        return Some(RunOutcome::Cancelled);
                    }
                }
                _ => {
                    if announced {
                        info!(job_id = %job_id, "Job resumed");
                    }
                    return None;
                }
            }
        }
    }

    /// Sleep unless cancelled first. Returns true when cancelled.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        let mut cancel = self.cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            res = cancel.wait_for(|cancelled| *cancelled) => res.is_ok(),
        }
    }

    fn set_job_total(&self, total: u64) {
        if let Some((registry, job_id)) = &self.job {
            if let Err(e) = registry.set_total(job_id, total) {
                warn!(job_id = %job_id, "Failed to record job total: {}", e);
            }
        }
    }

    fn update_job_progress(&self, delta: ProgressDelta) {
        if delta.is_empty() {
            return;
        }
        if let Some((registry, job_id)) = &self.job {
            if let Err(e) = registry.update_progress(job_id, delta) {
                warn!(job_id = %job_id, "Failed to update job progress: {}", e);
            }
        }
    }

    fn log_summary(&self, summary: &BatchSummary) {
        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            deferred = summary.deferred,
            skipped = summary.skipped,
            duration_secs = summary.duration_secs,
            throughput = summary.throughput,
            outcome = ?summary.outcome,
            "Batch finished"
        );
        let retry = &summary.retry;
        if retry.total > 0 {
            info!(
                exhausted = retry.exhausted,
                in_backoff = retry.in_backoff,
                ready = retry.ready_for_retry,
                "Retry ledger holds {} unit(s)",
                retry.total
            );
        }
        for record in self.ledger.exhausted() {
            warn!(
                unit = %record.unit_id,
                attempts = record.attempts,
                permanent = record.permanent,
                "Unit gave up: {}",
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
