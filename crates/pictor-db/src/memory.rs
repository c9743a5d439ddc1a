//! In-process implementations of every port.
//!
//! Each operation takes the store's mutex once, so it is atomic in the same
//! sense as the single-statement Postgres updates. The extra inherent methods
//! (`insert`, call counters, visibility delays) exist for seeding and
//! observing the stores from tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use pictor_core::models::{
    ArtifactKind, ArtifactRecord, ArtifactSettings, CacheFolder, Collection, Delivery, DeliveryId,
    JobState, JobStatus, ProcessingRequest,
};
use pictor_core::{Config, ErrorType};

use crate::ports::{
    CacheFolderRepository, CollectionRepository, JobRepository, RequestQueue, SettingsRepository,
};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("In-memory store lock poisoned"))
}

#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, JobState>>,
    increment_calls: AtomicUsize,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: JobState) -> Result<()> {
        lock(&self.jobs)?.insert(job.id, job);
        Ok(())
    }

    /// Backdate a job's progress timestamp.
    pub fn set_last_progress(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("Job {} not found", job_id))?;
        job.last_progress_at = at;
        Ok(())
    }

    /// Number of `increment_counters` calls so far.
    pub fn increment_calls(&self) -> usize {
        self.increment_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn get(&self, job_id: Uuid) -> Result<Option<JobState>> {
        Ok(lock(&self.jobs)?.get(&job_id).cloned())
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        let mut jobs = lock(&self.jobs)?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status == JobStatus::Pending {
            let now = Utc::now();
            job.status = JobStatus::Running;
            job.started_at.get_or_insert(now);
            job.last_progress_at = now;
        }
        Ok(Some(job.status))
    }

    async fn increment_counters(
        &self,
        job_id: Uuid,
        completed: i64,
        failed: i64,
    ) -> Result<Option<JobState>> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        let mut jobs = lock(&self.jobs)?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        let headroom = job.remaining();
        let add_completed = completed.max(0).min(headroom);
        let add_failed = failed.max(0).min(headroom - add_completed);
        job.completed += add_completed;
        job.failed += add_failed;
        job.last_progress_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn track_errors(
        &self,
        job_id: Uuid,
        counts: &BTreeMap<ErrorType, i64>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut jobs = lock(&self.jobs)?;
        if let Some(job) = jobs.get_mut(&job_id) {
            for (error_type, n) in counts {
                *job
                    .error_counts
                    .entry(error_type.as_str().to_string())
                    .or_insert(0) += n;
            }
            if let Some(message) = last_error {
                job.last_error = Some(message.to_string());
            }
        }
        Ok(())
    }

    async fn complete_if_finished(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = lock(&self.jobs)?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running && job.is_finished() => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<JobState>> {
        let jobs = lock(&self.jobs)?;
        let mut stale: Vec<JobState> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Running && job.last_progress_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.last_progress_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn claim_resume(
        &self,
        job_id: Uuid,
        stale_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Option<JobState>> {
        let mut jobs = lock(&self.jobs)?;
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.last_progress_at < stale_before
                    && job.last_resumed_at.map_or(true, |t| t < stale_before) =>
            {
                job.last_resumed_at = Some(at);
                job.failed = 0;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn fail_stale(
        &self,
        job_id: Uuid,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool> {
        let mut jobs = lock(&self.jobs)?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running && job.last_progress_at < cutoff => {
                job.status = JobStatus::Failed;
                job.failure_reason = Some(reason.to_string());
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let mut jobs = lock(&self.jobs)?;
        match jobs.get_mut(&job_id) {
            Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Running) => {
                job.status = JobStatus::Failed;
                job.failure_reason = Some(reason.to_string());
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = lock(&self.jobs)?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                let now = Utc::now();
                job.completed = job.total - job.failed;
                job.status = JobStatus::Completed;
                job.last_progress_at = now;
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resume_failed(&self, job_id: Uuid) -> Result<Option<JobState>> {
        let mut jobs = lock(&self.jobs)?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Failed && job.completed < job.total => {
                job.status = JobStatus::Running;
                job.failed = 0;
                job.error_counts.clear();
                job.failure_reason = None;
                job.last_progress_at = Utc::now();
                job.completed_at = None;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryCollectionRepository {
    collections: Mutex<HashMap<Uuid, Collection>>,
    /// Remaining lookups that should miss, per collection.
    hidden: Mutex<HashMap<Uuid, u32>>,
    get_calls: AtomicUsize,
    append_calls: AtomicUsize,
    fail_appends: AtomicBool,
}

impl MemoryCollectionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: Collection) -> Result<()> {
        lock(&self.collections)?.insert(collection.id, collection);
        Ok(())
    }

    /// Make the next `lookups` reads of `collection_id` miss, as if the write
    /// that created it had not reached the read path yet.
    pub fn hide_for_lookups(&self, collection_id: Uuid, lookups: u32) -> Result<()> {
        lock(&self.hidden)?.insert(collection_id, lookups);
        Ok(())
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectionRepository for MemoryCollectionRepository {
    async fn get(&self, collection_id: Uuid) -> Result<Option<Collection>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut hidden = lock(&self.hidden)?;
            if let Some(remaining) = hidden.get_mut(&collection_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(None);
                }
            }
        }
        Ok(lock(&self.collections)?.get(&collection_id).cloned())
    }

    async fn append_artifacts(
        &self,
        collection_id: Uuid,
        kind: ArtifactKind,
        records: &[ArtifactRecord],
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(anyhow!("Collection store unavailable"));
        }
        let mut collections = lock(&self.collections)?;
        let collection = collections
            .get_mut(&collection_id)
            .ok_or_else(|| anyhow!("Collection {} not found", collection_id))?;
        Ok(collection.merge_artifacts(kind, records))
    }
}

#[derive(Default)]
pub struct MemoryCacheFolderRepository {
    folders: Mutex<Vec<CacheFolder>>,
    increment_calls: AtomicUsize,
}

impl MemoryCacheFolderRepository {
    pub fn new(folders: Vec<CacheFolder>) -> Self {
        Self {
            folders: Mutex::new(folders),
            increment_calls: AtomicUsize::new(0),
        }
    }

    pub fn folder(&self, folder_id: Uuid) -> Result<Option<CacheFolder>> {
        Ok(lock(&self.folders)?
            .iter()
            .find(|f| f.id == folder_id)
            .cloned())
    }

    pub fn increment_calls(&self) -> usize {
        self.increment_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheFolderRepository for MemoryCacheFolderRepository {
    async fn list_active(&self) -> Result<Vec<CacheFolder>> {
        let mut active: Vec<CacheFolder> = lock(&self.folders)?
            .iter()
            .filter(|f| f.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|f| (f.priority, f.id));
        Ok(active)
    }

    async fn increment_used(&self, folder_id: Uuid, bytes: u64) -> Result<()> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        let mut folders = lock(&self.folders)?;
        if let Some(folder) = folders.iter_mut().find(|f| f.id == folder_id) {
            folder.current_size_bytes = folder.current_size_bytes.saturating_add(bytes);
        }
        Ok(())
    }

    async fn set_used(&self, folder_id: Uuid, bytes: u64) -> Result<()> {
        let mut folders = lock(&self.folders)?;
        if let Some(folder) = folders.iter_mut().find(|f| f.id == folder_id) {
            folder.current_size_bytes = bytes;
        }
        Ok(())
    }
}

/// Fixed per-kind settings, typically built from [`Config`].
#[derive(Default)]
pub struct StaticSettingsRepository {
    settings: Mutex<HashMap<ArtifactKind, ArtifactSettings>>,
    fail_lookups: AtomicBool,
}

impl StaticSettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let repo = Self::new();
        if let Ok(mut settings) = repo.settings.lock() {
            settings.insert(
                ArtifactKind::Thumbnail,
                ArtifactSettings {
                    format: config.default_output_format,
                    quality: config.default_thumbnail_quality,
                },
            );
            settings.insert(
                ArtifactKind::Cache,
                ArtifactSettings {
                    format: config.default_output_format,
                    quality: config.default_cache_quality,
                },
            );
        }
        repo
    }

    pub fn set(&self, kind: ArtifactKind, settings: ArtifactSettings) -> Result<()> {
        lock(&self.settings)?.insert(kind, settings);
        Ok(())
    }

    /// Make every lookup fail, simulating a settings store outage.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SettingsRepository for StaticSettingsRepository {
    async fn artifact_settings(&self, kind: ArtifactKind) -> Result<Option<ArtifactSettings>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(anyhow!("Settings store unavailable"));
        }
        Ok(lock(&self.settings)?.get(&kind).copied())
    }
}

struct QueueEntry {
    request: ProcessingRequest,
    attempts: u32,
    leased_until: Option<Instant>,
}

/// Requests for the same artifact of the same item on behalf of the same job.
fn same_work(a: &ProcessingRequest, b: &ProcessingRequest) -> bool {
    a.kind == b.kind
        && a.collection_id == b.collection_id
        && a.item_id == b.item_id
        && a.job_id == b.job_id
}

/// In-process queue with lease semantics: a received message that is never
/// acked becomes visible again once its lease runs out. A request that is
/// already queued, leased or not, is not enqueued a second time.
pub struct MemoryRequestQueue {
    entries: Mutex<BTreeMap<i64, QueueEntry>>,
    next_id: AtomicI64,
    lease: Duration,
}

impl MemoryRequestQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            lease,
        }
    }

    /// Messages not yet acknowledged, leased or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests not yet acknowledged, in enqueue order.
    pub fn pending_requests(&self) -> Result<Vec<ProcessingRequest>> {
        Ok(lock(&self.entries)?
            .values()
            .map(|entry| entry.request.clone())
            .collect())
    }

    /// End every lease now, as if all consumers had crashed.
    pub fn expire_leases(&self) -> Result<()> {
        for entry in lock(&self.entries)?.values_mut() {
            entry.leased_until = None;
        }
        Ok(())
    }
}

impl Default for MemoryRequestQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl RequestQueue for MemoryRequestQueue {
    async fn enqueue(&self, requests: &[ProcessingRequest]) -> Result<usize> {
        let mut entries = lock(&self.entries)?;
        let mut enqueued = 0;
        for request in requests {
            if entries
                .values()
                .any(|entry| same_work(&entry.request, request))
            {
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            entries.insert(
                id,
                QueueEntry {
                    request: request.clone(),
                    attempts: 0,
                    leased_until: None,
                },
            );
            enqueued += 1;
        }
        Ok(enqueued)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries)?;
        let mut deliveries = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if deliveries.len() >= max {
                break;
            }
            if entry.leased_until.is_some_and(|until| until > now) {
                continue;
            }
            entry.leased_until = Some(now + self.lease);
            entry.attempts += 1;
            deliveries.push(Delivery {
                id: DeliveryId(*id),
                request: entry.request.clone(),
                attempts: entry.attempts,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, ids: &[DeliveryId]) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        for id in ids {
            entries.remove(&id.0);
        }
        Ok(())
    }

    async fn nack(&self, ids: &[DeliveryId]) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        for id in ids {
            if let Some(entry) = entries.get_mut(&id.0) {
                entry.leased_until = None;
            }
        }
        Ok(())
    }
}
