use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::process::is_process_alive;
use super::registry::JobRegistry;
use super::types::JobError;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs failed because their owner is gone.
    pub orphaned: Vec<String>,
    /// Terminal jobs removed by the retention sweep.
    pub swept: usize,
}

/// Background task keeping the registry honest.
///
/// Each pass fails running or paused jobs whose owner process no longer
/// exists, then sweeps terminal jobs older than the retention window.
pub struct JobReconciler {
    registry: Arc<JobRegistry>,
    interval: Duration,
    retention: chrono::Duration,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobReconciler {
    pub fn new(registry: Arc<JobRegistry>, interval: Duration, retention: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry,
            interval,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Run one pass now.
    pub fn reconcile_once(&self) -> Result<ReconcileReport, JobError> {
        reconcile(&self.registry, self.retention)
    }

    /// Spawn the periodic loop. Returns `None` if it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Job reconciler already running");
            return None;
        }

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let retention = self.retention;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            info!("Job reconciler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Job reconciler received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = reconcile(&registry, retention) {
                            warn!("Job reconciliation failed: {}", e);
                        }
                    }
                }
            }
            info!("Job reconciler stopped");
        }))
    }

    /// Signal the loop to stop.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }
}

fn reconcile(
    registry: &JobRegistry,
    retention: chrono::Duration,
) -> Result<ReconcileReport, JobError> {
    let orphaned = registry.fail_orphaned(is_process_alive)?;
    let swept = registry.sweep_terminal(retention)?;
    Ok(ReconcileReport { orphaned, swept })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use tempfile::TempDir;

    /// A pid that existed moments ago and has since been reaped.
    async fn dead_pid() -> u32 {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        pid
    }

    #[tokio::test]
    async fn test_reconcile_fails_dead_owner() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new(dir.path().join("jobs.json")));
        let dead = registry.create("parse", "/in", "/out", serde_json::Value::Null).unwrap();
        let mine = registry.create("parse", "/in", "/out", serde_json::Value::Null).unwrap();
        registry.start(&dead, dead_pid().await).unwrap();
        registry.start(&mine, std::process::id()).unwrap();

        let reconciler = JobReconciler::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        let report = reconciler.reconcile_once().unwrap();

        assert_eq!(report.orphaned, vec![dead.clone()]);
        assert_eq!(registry.get(&dead).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(registry.get(&mine).unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_background_loop_runs_and_stops() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new(dir.path().join("jobs.json")));
        let dead = registry.create("parse", "/in", "/out", serde_json::Value::Null).unwrap();
        registry.start(&dead, dead_pid().await).unwrap();

        let reconciler = JobReconciler::new(
            Arc::clone(&registry),
            Duration::from_millis(20),
            Duration::from_secs(3600),
        );
        let handle = reconciler.start().unwrap();
        assert!(reconciler.start().is_none());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.get(&dead).unwrap().unwrap().status != JobStatus::Failed {
            assert!(tokio::time::Instant::now() < deadline, "reconciler never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        reconciler.stop();
        handle.await.unwrap();
    }
}
