//! Worker-side view of the job state store.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use pictor_core::models::{JobState, JobStatus};
use pictor_core::ErrorType;
use pictor_db::{CollectionRepository, JobRepository, RequestQueue};

use crate::recovery::{requeue_missing, Requeue};

/// Per-job outcome of one batch, applied with a single counter update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub completed: i64,
    pub failed: i64,
    pub errors: BTreeMap<ErrorType, i64>,
    pub last_error: Option<String>,
}

impl JobOutcome {
    pub fn record_success(&mut self) {
        self.completed += 1;
    }

    pub fn record_failure(&mut self, error_type: ErrorType, message: String) {
        self.failed += 1;
        *self.errors.entry(error_type).or_insert(0) += 1;
        self.last_error = Some(message);
    }

    pub fn is_empty(&self) -> bool {
        self.completed == 0 && self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Job reopened and this many requests re-enqueued. Items whose request
    /// was still queued are not counted.
    Requeued(usize),
    /// Job reopened but every artifact already exists; it was completed.
    AlreadyComplete,
    /// Job is not failed, has no work left, or does not exist.
    NotResumable,
}

#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<dyn JobRepository>,
    alert_every: i64,
}

impl JobTracker {
    pub fn new(jobs: Arc<dyn JobRepository>, alert_every: i64) -> Self {
        Self {
            jobs,
            alert_every: alert_every.max(1),
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    /// Mark every job running and return their current state. Unknown job ids
    /// are logged and left out of the map.
    #[tracing::instrument(skip(self, job_ids), fields(jobs = job_ids.len()))]
    pub async fn mark_running(&self, job_ids: &BTreeSet<Uuid>) -> Result<HashMap<Uuid, JobState>> {
        let mut states = HashMap::with_capacity(job_ids.len());
        for &job_id in job_ids {
            let status = self
                .jobs
                .mark_running(job_id)
                .await
                .with_context(|| format!("Failed to mark job {} running", job_id))?;
            match status {
                None => {
                    tracing::warn!(job_id = %job_id, "Batch references unknown job");
                }
                Some(status) => {
                    if status != JobStatus::Running {
                        tracing::debug!(job_id = %job_id, status = %status, "Job is not running");
                    }
                    if let Some(job) = self.jobs.get(job_id).await? {
                        states.insert(job_id, job);
                    }
                }
            }
        }
        Ok(states)
    }

    /// Apply one batch's counters to a job, tally its error types, raise the
    /// periodic failure alert and complete the job when everything is counted.
    #[tracing::instrument(skip(self, outcome), fields(completed = outcome.completed, failed = outcome.failed))]
    pub async fn record_outcomes(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
        if outcome.is_empty() {
            return Ok(());
        }

        let Some(updated) = self
            .jobs
            .increment_counters(job_id, outcome.completed, outcome.failed)
            .await
            .with_context(|| format!("Failed to update counters of job {}", job_id))?
        else {
            tracing::debug!(job_id = %job_id, "Job not running, dropping late counters");
            return Ok(());
        };

        if outcome.failed > 0 {
            self.jobs
                .track_errors(job_id, &outcome.errors, outcome.last_error.as_deref())
                .await
                .with_context(|| format!("Failed to track errors of job {}", job_id))?;

            let before = updated.failed - outcome.failed;
            if updated.failed / self.alert_every > before / self.alert_every {
                tracing::error!(
                    alert = true,
                    job_id = %job_id,
                    failed = updated.failed,
                    total = updated.total,
                    last_error = ?outcome.last_error,
                    "Job failure threshold reached"
                );
            }
        }

        if self.jobs.complete_if_finished(job_id).await? {
            tracing::info!(
                job_id = %job_id,
                completed = updated.completed,
                failed = updated.failed,
                total = updated.total,
                "Job completed"
            );
        }
        Ok(())
    }

    /// Reopen a failed job and re-enqueue its missing artifacts.
    #[tracing::instrument(skip(self, collections, queue))]
    pub async fn resume_failed(
        &self,
        job_id: Uuid,
        collections: &dyn CollectionRepository,
        queue: &dyn RequestQueue,
    ) -> Result<ResumeOutcome> {
        let Some(job) = self.jobs.resume_failed(job_id).await? else {
            return Ok(ResumeOutcome::NotResumable);
        };

        match requeue_missing(&job, collections, queue).await? {
            Some(Requeue { missing: 0, .. }) => {
                self.jobs.mark_completed(job_id).await?;
                Ok(ResumeOutcome::AlreadyComplete)
            }
            Some(Requeue { missing, enqueued }) => {
                tracing::info!(job_id = %job_id, missing, enqueued, "Failed job resumed");
                Ok(ResumeOutcome::Requeued(enqueued))
            }
            None => {
                self.jobs
                    .mark_failed(job_id, "Collection no longer exists")
                    .await?;
                Ok(ResumeOutcome::NotResumable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pictor_core::models::{
        ArtifactKind, Collection, CollectionItem, JobSettings, JobType,
    };
    use pictor_db::memory::{MemoryCollectionRepository, MemoryJobRepository, MemoryRequestQueue};

    fn settings() -> JobSettings {
        JobSettings {
            width: 64,
            height: 64,
            quality: None,
            format: None,
        }
    }

    async fn running_job(jobs: &MemoryJobRepository, total: i64) -> JobState {
        let job = JobState::new(JobType::GenerateThumbnails, Uuid::new_v4(), total, settings());
        jobs.insert(job.clone()).unwrap();
        jobs.mark_running(job.id).await.unwrap();
        job
    }

    #[tokio::test]
    async fn unknown_jobs_are_left_out() {
        let jobs = Arc::new(MemoryJobRepository::new());
        let job = JobState::new(JobType::GenerateCache, Uuid::new_v4(), 3, settings());
        jobs.insert(job.clone()).unwrap();
        let tracker = JobTracker::new(jobs, 10);

        let ids = BTreeSet::from([job.id, Uuid::new_v4()]);
        let states = tracker.mark_running(&ids).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[&job.id].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn outcome_completes_the_job_in_one_increment() {
        let jobs = Arc::new(MemoryJobRepository::new());
        let job = running_job(&jobs, 3).await;
        let tracker = JobTracker::new(jobs.clone(), 10);

        let mut outcome = JobOutcome::default();
        outcome.record_success();
        outcome.record_success();
        outcome.record_failure(ErrorType::GenerationFailure, "bad pixels".into());
        tracker.record_outcomes(job.id, &outcome).await.unwrap();

        let state = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(jobs.increment_calls(), 1);
        assert_eq!((state.completed, state.failed), (2, 1));
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.error_counts.get("generation_failure"), Some(&1));
        assert_eq!(state.last_error.as_deref(), Some("bad pixels"));
    }

    fn failures(n: usize) -> JobOutcome {
        let mut outcome = JobOutcome::default();
        for _ in 0..n {
            outcome.record_failure(ErrorType::GenerationFailure, "truncated".into());
        }
        outcome
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failure_alert_fires_once_per_ten_failures() {
        let jobs = Arc::new(MemoryJobRepository::new());
        let job = running_job(&jobs, 100).await;
        let tracker = JobTracker::new(jobs.clone(), 10);

        tracker.record_outcomes(job.id, &failures(9)).await.unwrap();
        assert!(!logs_contain("Job failure threshold reached"));

        // 9 -> 11 crosses one boundary in a single batch.
        tracker.record_outcomes(job.id, &failures(2)).await.unwrap();
        // 11 -> 12 crosses none.
        tracker.record_outcomes(job.id, &failures(1)).await.unwrap();

        let state = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(state.failed, 12);
        logs_assert(|lines: &[&str]| {
            let alerts = lines
                .iter()
                .filter(|line| line.contains("Job failure threshold reached"))
                .count();
            match alerts {
                1 => Ok(()),
                n => Err(format!("expected one alert, saw {n}")),
            }
        });
    }

    #[tokio::test]
    async fn counters_for_finished_jobs_are_dropped() {
        let jobs = Arc::new(MemoryJobRepository::new());
        let job = running_job(&jobs, 1).await;
        jobs.mark_failed(job.id, "stuck").await.unwrap();
        let tracker = JobTracker::new(jobs.clone(), 10);

        let mut outcome = JobOutcome::default();
        outcome.record_success();
        tracker.record_outcomes(job.id, &outcome).await.unwrap();

        let state = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(state.completed, 0);
        assert_eq!(state.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn resume_requeues_only_missing_items() {
        let jobs = Arc::new(MemoryJobRepository::new());
        let collections = MemoryCollectionRepository::new();
        let queue = MemoryRequestQueue::default();

        let mut collection = Collection::new(Uuid::new_v4());
        for i in 0..4 {
            collection.items.push(CollectionItem {
                id: Uuid::new_v4(),
                source: format!("/photos/{i}.png"),
                width: None,
                height: None,
            });
        }
        collections.insert(collection.clone()).unwrap();

        let mut job = JobState::new(JobType::GenerateThumbnails, collection.id, 4, settings());
        job.status = JobStatus::Failed;
        job.completed = 1;
        job.failed = 1;
        jobs.insert(job.clone()).unwrap();

        let tracker = JobTracker::new(jobs.clone(), 10);
        let outcome = tracker
            .resume_failed(job.id, &collections, &queue)
            .await
            .unwrap();

        assert_eq!(outcome, ResumeOutcome::Requeued(4));
        let requests = queue.pending_requests().unwrap();
        assert!(requests.iter().all(|r| r.job_id == Some(job.id)));
        assert!(requests.iter().all(|r| r.kind == ArtifactKind::Thumbnail));
        assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);

        assert_eq!(
            tracker.resume_failed(job.id, &collections, &queue).await.unwrap(),
            ResumeOutcome::NotResumable
        );
    }
}
