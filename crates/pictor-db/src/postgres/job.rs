use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};
use std::collections::BTreeMap;
use uuid::Uuid;

use pictor_core::models::{JobSettings, JobState, JobStatus};
use pictor_core::ErrorType;

use crate::ports::JobRepository;

const JOB_COLUMNS: &str = r#"
    id,
    job_type,
    collection_id,
    total,
    completed,
    failed,
    status,
    last_progress_at,
    last_resumed_at,
    error_counts,
    last_error,
    failure_reason,
    settings,
    created_at,
    started_at,
    completed_at
"#;

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    collection_id: Uuid,
    total: i64,
    completed: i64,
    failed: i64,
    status: String,
    last_progress_at: DateTime<Utc>,
    last_resumed_at: Option<DateTime<Utc>>,
    error_counts: Json<BTreeMap<String, i64>>,
    last_error: Option<String>,
    failure_reason: Option<String>,
    settings: Json<JobSettings>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobState {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobState {
            id: row.id,
            job_type: row.job_type.parse()?,
            collection_id: row.collection_id,
            total: row.total,
            completed: row.completed,
            failed: row.failed,
            status: row.status.parse()?,
            last_progress_at: row.last_progress_at,
            last_resumed_at: row.last_resumed_at,
            error_counts: row.error_counts.0,
            last_error: row.last_error,
            failure_reason: row.failure_reason,
            settings: row.settings.0,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn into_job(row: Option<JobRow>) -> Result<Option<JobState>> {
    row.map(JobState::try_from).transpose()
}

#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created job.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn insert(&self, job: &JobState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, collection_id, total, completed, failed, status,
                last_progress_at, error_counts, settings, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(job.job_type.to_string())
        .bind(job.collection_id)
        .bind(job.total)
        .bind(job.completed)
        .bind(job.failed)
        .bind(job.status.to_string())
        .bind(job.last_progress_at)
        .bind(Json(&job.error_counts))
        .bind(Json(&job.settings))
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert job")?;

        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, job_id: Uuid) -> Result<Option<JobState>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<Postgres, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")?;

        into_job(row)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_running(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                last_progress_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job running")?;

        if updated.rows_affected() > 0 {
            tracing::info!(job_id = %job_id, "Job started");
            return Ok(Some(JobStatus::Running));
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job status")?;

        status.map(|s| s.parse()).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn increment_counters(
        &self,
        job_id: Uuid,
        completed: i64,
        failed: i64,
    ) -> Result<Option<JobState>> {
        // Right-hand sides see the pre-update row, so both clamps use the same headroom.
        let sql = format!(
            r#"
            UPDATE jobs
            SET completed = completed + LEAST($2, GREATEST(total - completed - failed, 0)),
                failed = failed + LEAST(
                    $3,
                    GREATEST(total - completed - failed - LEAST($2, GREATEST(total - completed - failed, 0)), 0)
                ),
                last_progress_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<Postgres, JobRow>(&sql)
            .bind(job_id)
            .bind(completed.max(0))
            .bind(failed.max(0))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to increment job counters")?;

        into_job(row)
    }

    #[tracing::instrument(skip(self, counts, last_error))]
    async fn track_errors(
        &self,
        job_id: Uuid,
        counts: &BTreeMap<ErrorType, i64>,
        last_error: Option<&str>,
    ) -> Result<()> {
        if counts.is_empty() && last_error.is_none() {
            return Ok(());
        }
        let keys: Vec<String> = counts.keys().map(|k| k.as_str().to_string()).collect();
        let values: Vec<i64> = counts.values().copied().collect();

        sqlx::query(
            r#"
            UPDATE jobs
            SET error_counts = error_counts || (
                    SELECT COALESCE(
                        jsonb_object_agg(t.k, COALESCE((jobs.error_counts ->> t.k)::bigint, 0) + t.c),
                        '{}'::jsonb
                    )
                    FROM UNNEST($2::text[], $3::bigint[]) AS t(k, c)
                ),
                last_error = COALESCE($4, last_error)
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(&keys)
        .bind(&values)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .context("Failed to track job errors")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn complete_if_finished(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1 AND status = 'running' AND completed + failed >= total
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to complete job")?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<JobState>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'running' AND last_progress_at < $1
            ORDER BY last_progress_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<Postgres, JobRow>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to find stale jobs")?;

        rows.into_iter().map(JobState::try_from).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn claim_resume(
        &self,
        job_id: Uuid,
        stale_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Option<JobState>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET last_resumed_at = $3, failed = 0
            WHERE id = $1
              AND status = 'running'
              AND last_progress_at < $2
              AND (last_resumed_at IS NULL OR last_resumed_at < $2)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<Postgres, JobRow>(&sql)
            .bind(job_id)
            .bind(stale_before)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to claim job for resume")?;

        into_job(row)
    }

    #[tracing::instrument(skip(self))]
    async fn fail_stale(
        &self,
        job_id: Uuid,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', failure_reason = $3, completed_at = NOW()
            WHERE id = $1 AND status = 'running' AND last_progress_at < $2
            "#,
        )
        .bind(job_id)
        .bind(cutoff)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to fail stale job")?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_failed(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', failure_reason = $2, completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to mark job failed")?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_completed(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed = total - failed,
                last_progress_at = NOW(),
                completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job completed")?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn resume_failed(&self, job_id: Uuid) -> Result<Option<JobState>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                failed = 0,
                error_counts = '{{}}'::jsonb,
                failure_reason = NULL,
                last_progress_at = NOW(),
                completed_at = NULL
            WHERE id = $1 AND status = 'failed' AND completed < total
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<Postgres, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to resume job")?;

        into_job(row)
    }
}
