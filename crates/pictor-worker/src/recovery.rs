//! Stale job recovery.
//!
//! Running jobs without progress for longer than `T` are resumed by
//! re-enqueueing their missing artifacts, at most once per `T`. Resuming does
//! not count as progress, so a job that stays stuck reaches
//! `multiplier * T` and is failed instead. Every transition is a conditional
//! update, so concurrent sweeps from several instances are harmless.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use pictor_core::models::{JobState, ProcessingRequest};
use pictor_db::{CollectionRepository, JobRepository, RequestQueue};

use crate::config::RecoveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleAssessment {
    Healthy,
    Resume,
    Fail,
}

/// Tiered stale policy for a job that made no progress for `elapsed`.
pub fn assess_staleness(elapsed: Duration, timeout: Duration, multiplier: f64) -> StaleAssessment {
    if elapsed < timeout {
        return StaleAssessment::Healthy;
    }
    let fail_after = timeout.mul_f64(multiplier.max(1.0));
    if elapsed < fail_after {
        StaleAssessment::Resume
    } else {
        StaleAssessment::Fail
    }
}

/// Result of [`requeue_missing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requeue {
    /// Items without a valid artifact of the job's kind.
    pub missing: usize,
    /// Requests actually added; the rest were still queued.
    pub enqueued: usize,
}

/// Enqueue a request for every item of the job's collection that has no valid
/// artifact of the job's kind. `None` when the collection is gone.
pub async fn requeue_missing(
    job: &JobState,
    collections: &dyn CollectionRepository,
    queue: &dyn RequestQueue,
) -> Result<Option<Requeue>> {
    let Some(collection) = collections
        .get(job.collection_id)
        .await
        .with_context(|| format!("Failed to load collection {}", job.collection_id))?
    else {
        return Ok(None);
    };

    let kind = job.job_type.artifact_kind();
    let requests: Vec<ProcessingRequest> = collection
        .missing_items(kind)
        .into_iter()
        .map(|item| ProcessingRequest {
            kind,
            collection_id: collection.id,
            item_id: item.id,
            source: item.source.clone(),
            width: job.settings.width,
            height: job.settings.height,
            job_id: Some(job.id),
        })
        .collect();

    if requests.is_empty() {
        return Ok(Some(Requeue {
            missing: 0,
            enqueued: 0,
        }));
    }
    let enqueued = queue
        .enqueue(&requests)
        .await
        .with_context(|| format!("Failed to re-enqueue requests for job {}", job.id))?;
    Ok(Some(Requeue {
        missing: requests.len(),
        enqueued,
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Jobs another instance handled first, or that errored.
    pub skipped: usize,
}

pub struct StaleJobRecovery {
    jobs: Arc<dyn JobRepository>,
    collections: Arc<dyn CollectionRepository>,
    queue: Arc<dyn RequestQueue>,
    config: RecoveryConfig,
}

impl StaleJobRecovery {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        collections: Arc<dyn CollectionRepository>,
        queue: Arc<dyn RequestQueue>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            jobs,
            collections,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub async fn sweep(&self) -> Result<RecoveryReport> {
        self.sweep_at(Utc::now()).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let timeout = self.config.stale_timeout;
        let cutoff = now
            - chrono::Duration::from_std(timeout).context("Stale timeout out of range")?;
        let stale = self
            .jobs
            .find_stale(cutoff, self.config.sweep_limit)
            .await
            .context("Failed to query stale jobs")?;

        let mut report = RecoveryReport::default();
        for job in stale {
            let elapsed = (now - job.last_progress_at).to_std().unwrap_or_default();
            let assessment = assess_staleness(elapsed, timeout, self.config.fail_multiplier);
            let result = match assessment {
                StaleAssessment::Healthy => Ok(()),
                StaleAssessment::Resume if job.last_resumed_at.is_some_and(|at| at >= cutoff) => {
                    tracing::debug!(job_id = %job.id, "Stale job resumed recently, waiting");
                    Ok(())
                }
                StaleAssessment::Resume => self.resume(&job, now, cutoff, &mut report).await,
                StaleAssessment::Fail => self.fail(&job, cutoff, elapsed, &mut report).await,
            };
            if let Err(e) = result {
                report.skipped += 1;
                tracing::error!(job_id = %job.id, error = %e, "Stale job recovery failed");
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                resumed = report.resumed,
                failed = report.failed,
                requeued = report.requeued,
                skipped = report.skipped,
                "Stale job sweep finished"
            );
        }
        Ok(report)
    }

    async fn resume(
        &self,
        job: &JobState,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let Some(claimed) = self.jobs.claim_resume(job.id, cutoff, now).await? else {
            report.skipped += 1;
            return Ok(());
        };

        match requeue_missing(&claimed, self.collections.as_ref(), self.queue.as_ref()).await? {
            Some(Requeue { missing: 0, .. }) => {
                self.jobs.mark_completed(job.id).await?;
                tracing::info!(job_id = %job.id, "Stale job had nothing left, completed");
            }
            Some(Requeue { missing, enqueued }) => {
                report.requeued += enqueued;
                tracing::warn!(job_id = %job.id, missing, enqueued, "Resumed stale job");
            }
            None => {
                self.jobs
                    .mark_failed(job.id, "Collection no longer exists")
                    .await?;
                report.failed += 1;
                return Ok(());
            }
        }
        report.resumed += 1;
        Ok(())
    }

    async fn fail(
        &self,
        job: &JobState,
        cutoff: DateTime<Utc>,
        elapsed: Duration,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let reason = format!(
            "Job stuck without progress for {}s (timeout {}s)",
            elapsed.as_secs(),
            self.config.stale_timeout.as_secs()
        );
        if self.jobs.fail_stale(job.id, cutoff, &reason).await? {
            report.failed += 1;
            tracing::error!(job_id = %job.id, reason = %reason, "Failed stale job");
        } else {
            report.skipped += 1;
        }
        Ok(())
    }

    /// Sweep on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Stale job sweep failed");
                    }
                }
            }
        }
    }
}
