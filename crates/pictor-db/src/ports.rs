use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use pictor_core::models::{
    ArtifactKind, ArtifactRecord, ArtifactSettings, CacheFolder, Collection, Delivery, DeliveryId,
    JobState, JobStatus, ProcessingRequest,
};
use pictor_core::ErrorType;

/// Durable job progress. Every mutation is a single conditional statement so
/// that several worker instances can share one store.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Option<JobState>>;

    /// Move a pending job to running. Already-running jobs are left untouched.
    /// Returns the status after the call, or `None` when the job does not exist.
    async fn mark_running(&self, job_id: Uuid) -> Result<Option<JobStatus>>;

    /// Add to both counters of a running job and refresh `last_progress_at`.
    ///
    /// Increments are clamped so `completed + failed` never exceeds `total`.
    /// Returns the updated job, or `None` when the job is not running.
    async fn increment_counters(
        &self,
        job_id: Uuid,
        completed: i64,
        failed: i64,
    ) -> Result<Option<JobState>>;

    async fn increment_completed(&self, job_id: Uuid, n: i64) -> Result<Option<JobState>> {
        self.increment_counters(job_id, n, 0).await
    }

    async fn increment_failed(&self, job_id: Uuid, n: i64) -> Result<Option<JobState>> {
        self.increment_counters(job_id, 0, n).await
    }

    /// Add per-type failure counts and remember the latest failure message.
    async fn track_errors(
        &self,
        job_id: Uuid,
        counts: &BTreeMap<ErrorType, i64>,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// `Running -> Completed` when every item is accounted for. Returns whether
    /// this call made the transition.
    async fn complete_if_finished(&self, job_id: Uuid) -> Result<bool>;

    /// Running jobs whose last progress is older than `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<JobState>>;

    /// Claim a stale running job for resumption: stamp `last_resumed_at` with
    /// `at` and reset `failed`. Only applies while the job is running, has made
    /// no progress since `stale_before` and was not resumed since then either.
    /// `last_progress_at` is left alone. `None` means another instance got
    /// there first or the job was resumed recently.
    async fn claim_resume(
        &self,
        job_id: Uuid,
        stale_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Option<JobState>>;

    /// `Running -> Failed` for a job that is still stale relative to `cutoff`.
    async fn fail_stale(&self, job_id: Uuid, cutoff: DateTime<Utc>, reason: &str)
        -> Result<bool>;

    /// `Pending | Running -> Failed`.
    async fn mark_failed(&self, job_id: Uuid, reason: &str) -> Result<bool>;

    /// `Running -> Completed` with `completed` set to cover the rest of the
    /// total. Used when a resumed job turns out to have nothing left to do.
    async fn mark_completed(&self, job_id: Uuid) -> Result<bool>;

    /// `Failed -> Running` for a job that still has work left. Resets the
    /// failure counters so resumed items can be counted again.
    async fn resume_failed(&self, job_id: Uuid) -> Result<Option<JobState>>;
}

#[async_trait]
pub trait CollectionRepository: Send + Sync {
    async fn get(&self, collection_id: Uuid) -> Result<Option<Collection>>;

    /// Merge `records` into the collection's embedded array of `kind` in one
    /// atomic update. Existing records for the same source items are replaced.
    async fn append_artifacts(
        &self,
        collection_id: Uuid,
        kind: ArtifactKind,
        records: &[ArtifactRecord],
    ) -> Result<usize>;
}

#[async_trait]
pub trait CacheFolderRepository: Send + Sync {
    /// Active folders, highest priority (lowest number) first.
    async fn list_active(&self) -> Result<Vec<CacheFolder>>;

    async fn increment_used(&self, folder_id: Uuid, bytes: u64) -> Result<()>;

    /// Overwrite the recorded usage, e.g. after a recount of the folder on disk.
    async fn set_used(&self, folder_id: Uuid, bytes: u64) -> Result<()>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn artifact_settings(&self, kind: ArtifactKind) -> Result<Option<ArtifactSettings>>;
}

/// At-least-once work queue feeding the worker.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Returns how many requests were added. A request for work that is still
    /// queued (same kind, item and job) is skipped.
    async fn enqueue(&self, requests: &[ProcessingRequest]) -> Result<usize>;

    /// Lease up to `max` visible deliveries.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    async fn ack(&self, ids: &[DeliveryId]) -> Result<()>;

    /// Make the deliveries visible again right away.
    async fn nack(&self, ids: &[DeliveryId]) -> Result<()>;
}
