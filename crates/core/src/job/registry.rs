use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::process::{is_process_alive, terminate_process};
use super::types::{Job, JobError, JobFilter, JobProgress, JobStatus, ProgressDelta};
use crate::persist;

const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// Error recorded on jobs whose owner vanished.
pub(crate) const ORPHANED_ERROR: &str = "process terminated unexpectedly";

type JobMap = BTreeMap<String, Job>;

/// File-backed job registry.
///
/// Every mutation re-reads the file, applies the change and writes it back
/// atomically while holding an in-process lock, so several handles in one
/// process never lose each other's updates.
#[derive(Debug)]
pub struct JobRegistry {
    path: PathBuf,
    lock: Mutex<()>,
    termination_grace: Duration,
}

impl JobRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Time between SIGTERM and SIGKILL when cancelling a foreign owner.
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_all(&self) -> Result<JobMap, JobError> {
        Ok(persist::read_json(&self.path)?.unwrap_or_default())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut JobMap) -> Result<R, JobError>) -> Result<R, JobError> {
        let _guard = self.guard();
        let mut jobs = self.read_all()?;
        let result = f(&mut jobs)?;
        persist::write_json_atomic(&self.path, &jobs)?;
        Ok(result)
    }

    fn mutate_job<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut Job) -> Result<R, JobError>,
    ) -> Result<R, JobError> {
        self.mutate(|jobs| {
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            f(job)
        })
    }

    /// Register a new job in `Queued` state. Returns its id.
    pub fn create(
        &self,
        job_type: &str,
        input_location: &str,
        output_location: &str,
        config: serde_json::Value,
    ) -> Result<String, JobError> {
        let job = Job {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            status: JobStatus::Queued,
            input_location: input_location.to_string(),
            output_location: output_location.to_string(),
            start_time: Utc::now(),
            end_time: None,
            owner_pid: None,
            progress: JobProgress::default(),
            error: None,
            config,
        };
        let job_id = job.job_id.clone();

        self.mutate(|jobs| {
            jobs.insert(job_id.clone(), job);
            Ok(())
        })?;

        info!(job_id = %job_id, job_type, "Created job");
        Ok(job_id)
    }

    /// Attach an owner and move `Queued -> Running`.
    pub fn start(&self, job_id: &str, owner_pid: u32) -> Result<(), JobError> {
        self.mutate_job(job_id, |job| {
            if job.status != JobStatus::Queued {
                return Err(job.invalid("start"));
            }
            job.status = JobStatus::Running;
            job.owner_pid = Some(owner_pid);
            job.start_time = Utc::now();
            Ok(())
        })?;
        info!(job_id, owner_pid, "Job started");
        Ok(())
    }

    pub fn set_total(&self, job_id: &str, total: u64) -> Result<(), JobError> {
        self.mutate_job(job_id, |job| {
            if job.status.is_terminal() {
                return Err(job.invalid("update"));
            }
            job.progress.total = total;
            job.progress.recompute();
            Ok(())
        })
    }

    /// Add to the processed and failed counters.
    pub fn update_progress(
        &self,
        job_id: &str,
        delta: ProgressDelta,
    ) -> Result<JobProgress, JobError> {
        self.mutate_job(job_id, |job| {
            if job.status.is_terminal() {
                return Err(job.invalid("update"));
            }
            job.progress.processed = job.progress.processed.saturating_add_signed(delta.processed);
            job.progress.failed = job.progress.failed.saturating_add_signed(delta.failed);
            job.progress.recompute();
            Ok(job.progress.clone())
        })
    }

    /// Finish a running job: `Completed` without an error, `Failed` with one.
    pub fn complete(&self, job_id: &str, error: Option<String>) -> Result<JobStatus, JobError> {
        let status = self.mutate_job(job_id, |job| {
            if !job.status.is_active() {
                return Err(job.invalid("complete"));
            }
            let status = if error.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            job.finish(status, error.clone());
            Ok(status)
        })?;

        match &error {
            Some(e) => warn!(job_id, "Job failed: {}", e),
            None => info!(job_id, "Job completed"),
        }
        Ok(status)
    }

    /// Cancel a job. Returns false if it already reached a terminal status.
    ///
    /// A live owner other than the calling process is sent SIGTERM, then
    /// SIGKILL after the grace period.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, JobError> {
        let outcome = self.mutate_job(job_id, |job| {
            if !job.status.can_cancel() {
                return Ok(None);
            }
            job.finish(JobStatus::Cancelled, None);
            Ok(Some(job.owner_pid))
        })?;

        let Some(owner) = outcome else {
            debug!(job_id, "Cancel ignored, job already finished");
            return Ok(false);
        };
        info!(job_id, "Job cancelled");

        if let Some(pid) = owner {
            if pid != std::process::id() && is_process_alive(pid) {
                terminate_process(pid, self.termination_grace).await;
            }
        }
        Ok(true)
    }

    /// `Running -> Paused`.
    pub fn pause(&self, job_id: &str) -> Result<(), JobError> {
        self.mutate_job(job_id, |job| {
            if job.status != JobStatus::Running {
                return Err(job.invalid("pause"));
            }
            job.status = JobStatus::Paused;
            Ok(())
        })?;
        info!(job_id, "Job paused");
        Ok(())
    }

    /// `Paused -> Running`.
    pub fn resume(&self, job_id: &str) -> Result<(), JobError> {
        self.mutate_job(job_id, |job| {
            if job.status != JobStatus::Paused {
                return Err(job.invalid("resume"));
            }
            job.status = JobStatus::Running;
            Ok(())
        })?;
        info!(job_id, "Job resumed");
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        let _guard = self.guard();
        Ok(self.read_all()?.remove(job_id))
    }

    /// Jobs matching the filter, newest first.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let jobs = {
            let _guard = self.guard();
            self.read_all()?
        };
        let mut matching: Vec<Job> = jobs.into_values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matching.truncate(filter.limit);
        Ok(matching)
    }

    /// Fail every running or paused job whose owner is gone.
    ///
    /// Returns the ids of the jobs that were failed.
    pub fn fail_orphaned(&self, is_alive: impl Fn(u32) -> bool) -> Result<Vec<String>, JobError> {
        let orphaned = self.mutate(|jobs| {
            let mut orphaned = Vec::new();
            for job in jobs.values_mut() {
                if !job.status.is_active() {
                    continue;
                }
                let dead = match job.owner_pid {
                    Some(pid) => !is_alive(pid),
                    None => false,
                };
                if dead {
                    job.finish(JobStatus::Failed, Some(ORPHANED_ERROR.to_string()));
                    orphaned.push(job.job_id.clone());
                }
            }
            Ok(orphaned)
        })?;

        for job_id in &orphaned {
            warn!(job_id = %job_id, "Owner process gone, job marked failed");
        }
        Ok(orphaned)
    }

    /// Delete terminal jobs that ended more than `retention` ago.
    pub fn sweep_terminal(&self, retention: chrono::Duration) -> Result<usize, JobError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let removed = self.mutate(|jobs| {
            let before = jobs.len();
            jobs.retain(|_, job| {
                !(job.status.is_terminal() && job.end_time.is_some_and(|end| end < cutoff))
            });
            Ok(before - jobs.len())
        })?;

        if removed > 0 {
            info!("Swept {} expired job(s) from the registry", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> JobRegistry {
        JobRegistry::new(dir.path().join("jobs.json"))
            .with_termination_grace(Duration::from_millis(100))
    }

    fn create(reg: &JobRegistry) -> String {
        reg.create("parse", "/in", "/out", serde_json::json!({"chunk_size": 10}))
            .unwrap()
    }

    #[test]
    fn test_create_is_queued() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);

        let job = reg.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.config["chunk_size"], 10);
        assert!(job.end_time.is_none());
    }

    #[test]
    fn test_lifecycle_to_completed() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);

        reg.start(&id, std::process::id()).unwrap();
        reg.set_total(&id, 4).unwrap();
        reg.update_progress(
            &id,
            ProgressDelta {
                processed: 3,
                failed: 1,
            },
        )
        .unwrap();
        assert_eq!(reg.complete(&id, None).unwrap(), JobStatus::Completed);

        let job = reg.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.percentage, 100.0);
        assert!(job.end_time.is_some());
    }

    #[test]
    fn test_complete_with_error_fails() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);
        reg.start(&id, 1).unwrap();
        assert_eq!(
            reg.complete(&id, Some("engine unavailable".into())).unwrap(),
            JobStatus::Failed
        );
        assert_eq!(
            reg.get(&id).unwrap().unwrap().error.as_deref(),
            Some("engine unavailable")
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);

        assert!(matches!(
            reg.complete(&id, None),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(reg.pause(&id).is_err());

        reg.start(&id, 1).unwrap();
        assert!(reg.start(&id, 1).is_err());
        reg.complete(&id, None).unwrap();
        let end = reg.get(&id).unwrap().unwrap().end_time;

        assert!(reg.complete(&id, None).is_err());
        assert!(reg.update_progress(&id, ProgressDelta::default()).is_err());
        assert_eq!(reg.get(&id).unwrap().unwrap().end_time, end);
    }

    #[test]
    fn test_unknown_job() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        assert!(reg.get("nope").unwrap().is_none());
        assert!(matches!(reg.start("nope", 1), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_pause_resume() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);
        reg.start(&id, 1).unwrap();

        reg.pause(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().unwrap().status, JobStatus::Paused);
        assert!(reg.pause(&id).is_err());
        reg.resume(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_own_job() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);
        reg.start(&id, std::process::id()).unwrap();

        assert!(reg.cancel(&id).await.unwrap());
        assert_eq!(reg.get(&id).unwrap().unwrap().status, JobStatus::Cancelled);
        // Terminal: second cancel is a no-op.
        assert!(!reg.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);
        assert!(reg.cancel(&id).await.unwrap());
        assert!(reg.start(&id, 1).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_foreign_owner() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = create(&reg);

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });
        reg.start(&id, pid).unwrap();

        assert!(reg.cancel(&id).await.unwrap());
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_fail_orphaned() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let dead = create(&reg);
        let alive = create(&reg);
        let queued = create(&reg);
        reg.start(&dead, 111).unwrap();
        reg.start(&alive, 222).unwrap();

        let orphaned = reg.fail_orphaned(|pid| pid == 222).unwrap();
        assert_eq!(orphaned, vec![dead.clone()]);

        let job = reg.get(&dead).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(ORPHANED_ERROR));
        assert_eq!(reg.get(&alive).unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(reg.get(&queued).unwrap().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_sweep_terminal() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let done = create(&reg);
        let running = create(&reg);
        reg.start(&done, 1).unwrap();
        reg.start(&running, 1).unwrap();
        reg.complete(&done, None).unwrap();

        assert_eq!(reg.sweep_terminal(chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(reg.sweep_terminal(chrono::Duration::seconds(-1)).unwrap(), 1);
        assert!(reg.get(&done).unwrap().is_none());
        assert!(reg.get(&running).unwrap().is_some());
    }

    #[test]
    fn test_list_filter() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let a = create(&reg);
        let _b = create(&reg);
        let c = reg
            .create("index", "/in", "/out", serde_json::Value::Null)
            .unwrap();
        reg.start(&a, 1).unwrap();

        assert_eq!(reg.list(&JobFilter::new()).unwrap().len(), 3);
        assert_eq!(
            reg.list(&JobFilter::new().with_status(JobStatus::Running))
                .unwrap()[0]
                .job_id,
            a
        );
        let typed = reg
            .list(&JobFilter::new().with_job_type("index"))
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].job_id, c);
        assert_eq!(reg.list(&JobFilter::new().with_limit(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_handles_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let reg = std::sync::Arc::new(registry(&dir));
        let id = create(&reg);
        reg.start(&id, 1).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        reg.update_progress(
                            &id,
                            ProgressDelta {
                                processed: 1,
                                failed: 0,
                            },
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(reg.get(&id).unwrap().unwrap().progress.processed, 80);
    }
}
