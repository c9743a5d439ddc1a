//! pictor-worker: batch artifact worker.
//!
//! Reads configuration from the environment (`.env` supported). Requires DATABASE_URL.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pictor_core::Config;
use pictor_db::{
    connect, PgCacheFolderRepository, PgCollectionRepository, PgJobRepository, PgRequestQueue,
    PgSettingsRepository,
};
use pictor_infra::{init_telemetry, shutdown_telemetry};
use pictor_processing::ImageArtifactGenerator;
use pictor_storage::{LocalArtifactStore, PathResolver};
use pictor_worker::{
    recount_folder_usage, AccumulatorConfig, AdaptiveBatchSizePolicy, BatchConsumer,
    ConsumerConfig, FixedBatchSize, HealthMonitor, JobTracker, MemoryBudget, RecoveryConfig,
    ResumeOutcome, RuntimeConfig, StaleJobRecovery, WorkerRuntime,
};

#[derive(Parser)]
#[command(name = "pictor-worker", about = "Batch thumbnail and cache worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the request queue until interrupted (default)
    Run {
        /// Do not run the stale job sweep in this process
        #[arg(long)]
        no_recovery: bool,
    },
    /// Run one stale job sweep and exit
    Sweep,
    /// Recount cache folder usage from disk
    RecountFolders,
    /// Reopen a failed job and re-enqueue its missing artifacts
    ResumeJob {
        /// Job UUID
        job_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    init_telemetry("pictor-worker", config.log_format)?;

    let result = run(cli, config).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "pictor-worker exited with error");
    }
    shutdown_telemetry().await;
    result
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let pool = connect(&config).await?;

    let jobs = Arc::new(PgJobRepository::new(pool.clone()));
    let collections = Arc::new(PgCollectionRepository::new(pool.clone()));
    let folders = Arc::new(PgCacheFolderRepository::new(pool.clone()));
    let settings = Arc::new(PgSettingsRepository::new(pool.clone()));
    let queue = Arc::new(PgRequestQueue::new(
        pool.clone(),
        Duration::from_secs(config.worker_queue_lease_secs),
    ));

    let tracker = JobTracker::new(jobs.clone(), config.failure_alert_every);
    let recovery = Arc::new(StaleJobRecovery::new(
        jobs.clone(),
        collections.clone(),
        queue.clone(),
        RecoveryConfig::from_config(&config),
    ));

    match cli.command.unwrap_or(Commands::Run { no_recovery: false }) {
        Commands::Sweep => {
            let report = recovery.sweep().await?;
            tracing::info!(?report, "Sweep finished");
            Ok(())
        }
        Commands::RecountFolders => {
            let recounted = recount_folder_usage(folders.as_ref()).await?;
            tracing::info!(folders = recounted.len(), "Folder usage recounted");
            Ok(())
        }
        Commands::ResumeJob { job_id } => {
            match tracker
                .resume_failed(job_id, collections.as_ref(), queue.as_ref())
                .await?
            {
                ResumeOutcome::Requeued(n) => tracing::info!(%job_id, requeued = n, "Job resumed"),
                ResumeOutcome::AlreadyComplete => tracing::info!(%job_id, "Job had nothing left"),
                ResumeOutcome::NotResumable => tracing::warn!(%job_id, "Job cannot be resumed"),
            }
            Ok(())
        }
        Commands::Run { no_recovery } => {
            let consumer_config = ConsumerConfig::from_config(&config);
            let accumulator_config = AccumulatorConfig::from_config(&config);
            let mut runtime_config = RuntimeConfig::from_config(&config);
            runtime_config.recovery_enabled = !no_recovery;

            let resolver = PathResolver::default();
            let consumer = Arc::new(BatchConsumer::new(
                tracker,
                collections,
                folders,
                settings,
                resolver.clone(),
                Arc::new(ImageArtifactGenerator::new(
                    resolver,
                    consumer_config.max_plain_file_bytes,
                    consumer_config.max_archive_entry_bytes,
                )),
                Arc::new(LocalArtifactStore::new()),
                MemoryBudget::new(runtime_config.memory_budget_bytes),
                consumer_config,
            ));

            let policy = Arc::new(AdaptiveBatchSizePolicy::new(
                FixedBatchSize::from_config(&accumulator_config),
                runtime_config.unhealthy_lag,
                runtime_config.unhealthy_error_rate,
            ));
            let runtime = WorkerRuntime::new(
                queue,
                consumer,
                Arc::new(HealthMonitor::new()),
                policy,
                runtime_config,
                accumulator_config,
            )
            .with_recovery(recovery);

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                tracing::info!("Shutdown signal received");
                signal.cancel();
            });

            runtime.run(shutdown).await
        }
    }
}
