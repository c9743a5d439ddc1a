use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::artifact::{ArtifactKind, OutputFormat};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    GenerateThumbnails,
    GenerateCache,
}

impl JobType {
    pub fn artifact_kind(&self) -> ArtifactKind {
        match self {
            JobType::GenerateThumbnails => ArtifactKind::Thumbnail,
            JobType::GenerateCache => ArtifactKind::Cache,
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobType::GenerateThumbnails => write!(f, "generate_thumbnails"),
            JobType::GenerateCache => write!(f, "generate_cache"),
        }
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate_thumbnails" => Ok(JobType::GenerateThumbnails),
            "generate_cache" => Ok(JobType::GenerateCache),
            _ => Err(anyhow::anyhow!("Invalid job type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Settings captured when the job was queued; re-used when the job is resumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSettings {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

/// Durable progress record of one bulk job.
///
/// Invariant: `completed + failed <= total`. Counters only move through the
/// atomic increment operations of the job repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub id: Uuid,
    pub job_type: JobType,
    pub collection_id: Uuid,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub status: JobStatus,
    /// Moved only by counter increments and by starting or reopening the job.
    pub last_progress_at: DateTime<Utc>,
    /// Last time stale-job recovery re-enqueued the job's missing items.
    pub last_resumed_at: Option<DateTime<Utc>>,
    pub error_counts: BTreeMap<String, i64>,
    /// Message of the most recent per-item failure.
    pub last_error: Option<String>,
    /// Set when the job itself fails, e.g. by stale-job recovery.
    pub failure_reason: Option<String>,
    pub settings: JobSettings,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    /// A freshly queued job, as created by the bulk-operation service.
    pub fn new(
        job_type: JobType,
        collection_id: Uuid,
        total: i64,
        settings: JobSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            collection_id,
            total,
            completed: 0,
            failed: 0,
            status: JobStatus::Pending,
            last_progress_at: now,
            last_resumed_at: None,
            error_counts: BTreeMap::new(),
            last_error: None,
            failure_reason: None,
            settings,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn processed(&self) -> i64 {
        self.completed + self.failed
    }

    pub fn remaining(&self) -> i64 {
        (self.total - self.processed()).max(0)
    }

    pub fn is_finished(&self) -> bool {
        self.processed() >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_and_status_parse() {
        assert_eq!(
            "generate_cache".parse::<JobType>().unwrap().artifact_kind(),
            ArtifactKind::Cache
        );
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("stuck".parse::<JobStatus>().is_err());
    }

    #[test]
    fn remaining_never_goes_negative() {
        let settings = JobSettings {
            width: 100,
            height: 100,
            quality: None,
            format: None,
        };
        let mut job = JobState::new(JobType::GenerateThumbnails, Uuid::new_v4(), 5, settings);
        job.completed = 4;
        job.failed = 1;
        assert_eq!(job.remaining(), 0);
        assert!(job.is_finished());
    }
}
