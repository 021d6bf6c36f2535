mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docbatch_core::{
    default_max_instances, load_config, orchestrator::ProgressCallback, validate_config,
    AdaptiveScaler, BatchOrchestrator, BatchProgress, Config, InstancePool, JobReconciler,
    JobRegistry, OrchestratorConfig, ProcessEngineFactory, ProcessorConfig, ResourceSampler,
    RunOutcome, SystemSampler, UnitProcessor,
};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status for runs that stopped on the failure-rate checks.
const EXIT_FAILURES: i32 = 2;
/// Exit status for cancelled runs (128 + SIGINT).
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("DOCBATCH_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run() -> Result<i32> {
    init_logging();

    // Determine config path
    let config_path = std::env::var("DOCBATCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("docbatch.toml"));

    info!("docbatch {} loading configuration from {:?}", VERSION, config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    let hash = config_hash(&config)?;
    info!("Input directory: {:?}", config.batch.input_dir);
    info!("Output directory: {:?}", config.batch.output_dir);
    info!("Engine: {:?}", config.engine.path);
    info!("Config hash: {}", &hash[..16]);

    // Job registry and orphan reconciliation
    let registry = Arc::new(
        JobRegistry::new(config.registry_path()).with_termination_grace(Duration::from_secs(
            config.jobs.termination_grace_secs,
        )),
    );
    let reconciler = JobReconciler::new(
        Arc::clone(&registry),
        Duration::from_secs(config.jobs.reconcile_interval_secs),
        Duration::from_secs(config.jobs.retention_hours * 3600),
    );
    let report = reconciler
        .reconcile_once()
        .context("Failed to reconcile job registry")?;
    if !report.orphaned.is_empty() {
        warn!("Marked {} orphaned job(s) as failed", report.orphaned.len());
    }
    let reconciler_handle = reconciler.start();

    let job_id = registry
        .create(
            &config.jobs.job_type,
            &config.batch.input_dir.display().to_string(),
            &config.batch.output_dir.display().to_string(),
            job_config(&config, &hash)?,
        )
        .context("Failed to register job")?;
    info!("Registered job {}", job_id);

    // Engine pool sized from the host unless fixed in config
    let sampler: Arc<dyn ResourceSampler> = Arc::new(SystemSampler::new());
    let snapshot = sampler.sample();
    info!("Host resources: {}", snapshot.to_log_string());
    let max_instances = config.pool.max_instances.unwrap_or_else(|| {
        default_max_instances(
            &snapshot,
            config.pool.per_instance_memory_gb,
            config.batch.max_workers,
        )
    });
    info!("Engine pool limited to {} instance(s)", max_instances);

    let pool = Arc::new(InstancePool::new(
        ProcessEngineFactory::new(config.engine.clone()),
        max_instances,
    ));
    let processor = Arc::new(UnitProcessor::new(pool, ProcessorConfig::from_config(&config)));
    let scaler = AdaptiveScaler::new(sampler, config.scaler.clone(), config.batch.max_workers);
    let mut orchestrator =
        BatchOrchestrator::new(OrchestratorConfig::from_config(&config), processor, scaler)
            .with_job(Arc::clone(&registry), job_id.clone());

    // Cancel on Ctrl+C / SIGTERM; in-flight units finish first
    let cancel = orchestrator.cancel_handle();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping after in-flight units");
        cancel.cancel();
    });

    let progress: ProgressCallback = Arc::new(|progress: &BatchProgress| {
        info!(
            successful = progress.successful,
            failed = progress.failed,
            deferred = progress.deferred,
            workers = progress.workers,
            "Progress {:.1}% ({} chunk(s))",
            progress.percentage,
            progress.chunks
        );
    });
    let result = orchestrator.run(Some(progress)).await;

    signal_task.abort();
    reconciler.stop();
    if let Some(handle) = reconciler_handle {
        let _ = handle.await;
    }

    if let Ok(summary) = &result {
        metrics::record_summary(summary);
    }
    match metrics::encode_metrics() {
        Ok(text) => info!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to encode metrics: {}", e),
    }

    let summary = result.with_context(|| format!("Batch run {} failed", job_id))?;
    Ok(exit_code(&summary.outcome))
}

/// SHA-256 of the serialized configuration, hex encoded.
fn config_hash(config: &Config) -> Result<String> {
    let config_json = serde_json::to_string(config).context("Failed to serialize config")?;
    Ok(format!("{:x}", Sha256::digest(config_json.as_bytes())))
}

/// Snapshot of the configuration stored with the job.
fn job_config(config: &Config, hash: &str) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config).context("Failed to serialize config")?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("config_hash".to_string(), hash.into());
        obj.insert("version".to_string(), VERSION.into());
    }
    Ok(value)
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed => 0,
        RunOutcome::Aborted { .. } | RunOutcome::TooManyFailures { .. } => EXIT_FAILURES,
        RunOutcome::Cancelled => EXIT_CANCELLED,
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
