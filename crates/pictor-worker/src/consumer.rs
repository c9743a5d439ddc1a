//! Batch consumer.
//!
//! Processes one flushed [`BatchWindow`]: validate, skip what already exists,
//! generate in memory, allocate destinations and write grouped by folder, then
//! persist with one collection update per collection and one counter update
//! per job. Per-item failures never abort the batch; only shared lookups
//! (jobs, settings, folders, collections) do.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use pictor_core::models::{
    ArtifactKind, ArtifactRecord, ArtifactSettings, CacheFolder, Collection, Delivery,
    DeliveryId, JobState, ProcessingRequest,
};
use pictor_core::{ItemError, LogLevel};
use pictor_db::{CacheFolderRepository, CollectionRepository, SettingsRepository};
use pictor_processing::{
    estimate_jpeg_quality, probe_dimensions, ArtifactGenerator, GenerateError, GeneratedArtifact,
    RenderSpec,
};
use pictor_storage::{
    artifact_relative_path, ArtifactStore, DestinationAllocator, PathResolver, ResolveError,
    SourceRef,
};

use crate::accumulator::BatchWindow;
use crate::budget::{MemoryBudget, MemoryReservation};
use crate::config::ConsumerConfig;
use crate::tracker::{JobOutcome, JobTracker};

/// What happened to each delivery of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub ack: Vec<DeliveryId>,
    pub nack: Vec<DeliveryId>,
    /// Artifacts generated or adopted and persisted.
    pub completed: usize,
    /// Items that already had a valid artifact.
    pub skipped: usize,
    pub failed: usize,
    /// Files written to cache folders.
    pub written: usize,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.completed + self.skipped
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    /// Same item earlier in the batch.
    Duplicate,
    /// Artifact already recorded. Only counted for the job when it was
    /// generated before the job started; otherwise an earlier batch of the
    /// same job already counted it.
    Skipped { counted: bool },
    Failed(ItemError),
    /// Record built, waiting for the collection update.
    Staged(ArtifactRecord),
    Completed,
    /// Written but the collection update failed; redelivery adopts the file.
    Unpersisted,
}

struct GenerationTask {
    slot: usize,
    source: SourceRef,
    source_bytes: u64,
    spec: RenderSpec,
}

struct Buffered {
    slot: usize,
    collection_id: Uuid,
    item_id: Uuid,
    artifact: GeneratedArtifact,
    _reservation: MemoryReservation,
}

/// Mutable state of the batch being processed.
struct BatchState {
    kind: ArtifactKind,
    deliveries: Vec<Delivery>,
    slots: Vec<Slot>,
    allocator: DestinationAllocator,
    buffered: Vec<Buffered>,
    written: usize,
}

impl BatchState {
    fn request(&self, index: usize) -> Option<&ProcessingRequest> {
        self.deliveries.get(index).map(|d| &d.request)
    }

    fn set(&mut self, index: usize, next: Slot) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = next;
        }
    }

    fn fail(&mut self, index: usize, error: ItemError) {
        if let Some(request) = self.request(index) {
            log_item_failure(request, &error);
        }
        self.set(index, Slot::Failed(error));
    }
}

pub struct BatchConsumer {
    tracker: JobTracker,
    collections: Arc<dyn CollectionRepository>,
    folders: Arc<dyn CacheFolderRepository>,
    settings: Arc<dyn SettingsRepository>,
    resolver: PathResolver,
    generator: Arc<dyn ArtifactGenerator>,
    store: Arc<dyn ArtifactStore>,
    budget: MemoryBudget,
    config: ConsumerConfig,
}

impl BatchConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: JobTracker,
        collections: Arc<dyn CollectionRepository>,
        folders: Arc<dyn CacheFolderRepository>,
        settings: Arc<dyn SettingsRepository>,
        resolver: PathResolver,
        generator: Arc<dyn ArtifactGenerator>,
        store: Arc<dyn ArtifactStore>,
        budget: MemoryBudget,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            tracker,
            collections,
            folders,
            settings,
            resolver,
            generator,
            store,
            budget,
            config,
        }
    }

    #[tracing::instrument(skip(self, window), fields(kind = %window.kind, size = window.len()))]
    pub async fn process_batch(&self, window: BatchWindow) -> Result<BatchReport> {
        let opened_at = window.opened_at;
        let kind = window.kind;

        let job_ids: BTreeSet<Uuid> = window
            .deliveries
            .iter()
            .filter_map(|d| d.request.job_id)
            .collect();
        let jobs = self.tracker.mark_running(&job_ids).await?;

        let base_settings = self
            .settings
            .artifact_settings(kind)
            .await
            .with_context(|| format!("Failed to load {} settings", kind))?
            .unwrap_or_else(|| self.config.default_settings(kind));
        let folders = self
            .folders
            .list_active()
            .await
            .context("Failed to list cache folders")?;

        let mut batch = BatchState {
            kind,
            slots: window.deliveries.iter().map(|_| Slot::Pending).collect(),
            deliveries: window.deliveries,
            allocator: DestinationAllocator::new(folders),
            buffered: Vec::new(),
            written: 0,
        };

        let mut seen = HashSet::new();
        let mut needed: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
        let mut duplicates = Vec::new();
        for (index, delivery) in batch.deliveries.iter().enumerate() {
            let request = &delivery.request;
            if !seen.insert((request.collection_id, request.item_id)) {
                duplicates.push(index);
                continue;
            }
            needed
                .entry(request.collection_id)
                .or_default()
                .insert(request.item_id);
        }
        for index in duplicates {
            batch.set(index, Slot::Duplicate);
        }

        let mut collections: HashMap<Uuid, Collection> = HashMap::new();
        for (collection_id, items) in &needed {
            if let Some(collection) = self.load_collection(*collection_id, items).await? {
                collections.insert(*collection_id, collection);
            }
        }

        let mut tasks = Vec::new();
        for index in 0..batch.deliveries.len() {
            if !matches!(batch.slots.get(index), Some(Slot::Pending)) {
                continue;
            }
            let Some(request) = batch.request(index) else {
                continue;
            };
            let settings = effective_settings(base_settings, request, &jobs);
            let job_started = request
                .job_id
                .and_then(|id| jobs.get(&id))
                .and_then(|job| job.started_at);
            match self
                .prepare(index, request, settings, &collections, batch.allocator.folders())
                .await
            {
                Ok(Prepared::Skip { generated_at }) => {
                    let counted = job_started.map_or(true, |started| generated_at < started);
                    batch.set(index, Slot::Skipped { counted })
                }
                Ok(Prepared::Adopt(record)) => batch.set(index, Slot::Staged(record)),
                Ok(Prepared::Generate(task)) => tasks.push(task),
                Err(error) => batch.fail(index, error),
            }
        }

        for task in tasks {
            let input = self.reserve(task.source_bytes, &mut batch).await?;
            let generated = self.generator.generate(&task.source, &task.spec).await;
            drop(input);

            match generated {
                Ok(artifact) => {
                    let reservation = self.reserve(artifact.size_bytes(), &mut batch).await?;
                    let Some(request) = batch.request(task.slot) else {
                        continue;
                    };
                    let (collection_id, item_id) = (request.collection_id, request.item_id);
                    batch.buffered.push(Buffered {
                        slot: task.slot,
                        collection_id,
                        item_id,
                        artifact,
                        _reservation: reservation,
                    });
                }
                Err(e) => batch.fail(task.slot, generation_failure(e)),
            }
        }
        self.write_buffered(&mut batch).await;

        self.persist(&mut batch).await;
        self.record_job_outcomes(&batch).await;
        self.flush_folder_usage(&batch.allocator).await;

        let mut report = BatchReport {
            written: batch.written,
            ..BatchReport::default()
        };
        for (delivery, slot) in batch.deliveries.iter().zip(&batch.slots) {
            match slot {
                Slot::Completed => {
                    report.completed += 1;
                    report.ack.push(delivery.id);
                }
                Slot::Skipped { .. } => {
                    report.skipped += 1;
                    report.ack.push(delivery.id);
                }
                Slot::Failed(_) => {
                    report.failed += 1;
                    report.ack.push(delivery.id);
                }
                Slot::Duplicate => report.ack.push(delivery.id),
                Slot::Pending | Slot::Staged(_) | Slot::Unpersisted => {
                    report.nack.push(delivery.id)
                }
            }
        }

        tracing::info!(
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            written = report.written,
            nacked = report.nack.len(),
            waited_ms = opened_at.elapsed().as_millis() as u64,
            "Batch processed"
        );
        Ok(report)
    }

    /// Look a collection up, retrying while it (or one of the items the
    /// batch needs) is not visible yet. Returns whatever the last attempt saw.
    async fn load_collection(
        &self,
        collection_id: Uuid,
        items: &BTreeSet<Uuid>,
    ) -> Result<Option<Collection>> {
        let attempts = self.config.visibility_retry_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            let collection = self
                .collections
                .get(collection_id)
                .await
                .with_context(|| format!("Failed to load collection {}", collection_id))?;
            let visible = collection
                .as_ref()
                .is_some_and(|c| items.iter().all(|id| c.item(*id).is_some()));
            if visible {
                if attempt > 1 {
                    tracing::debug!(collection_id = %collection_id, attempt, "Collection became visible");
                }
                return Ok(collection);
            }
            last = collection;
            if attempt < attempts {
                tokio::time::sleep(self.config.visibility_retry_delay).await;
            }
        }
        tracing::warn!(collection_id = %collection_id, attempts, "Collection not fully visible");
        Ok(last)
    }

    async fn prepare(
        &self,
        slot: usize,
        request: &ProcessingRequest,
        settings: ArtifactSettings,
        collections: &HashMap<Uuid, Collection>,
        folders: &[CacheFolder],
    ) -> Result<Prepared, ItemError> {
        let collection = collections
            .get(&request.collection_id)
            .filter(|c| c.item(request.item_id).is_some())
            .ok_or_else(|| ItemError::TransientVisibility {
                attempts: self.config.visibility_retry_attempts.max(1),
                message: format!(
                    "Item {} not found in collection {}",
                    request.item_id, request.collection_id
                ),
            })?;

        let resolved = self
            .resolver
            .resolve(&request.source)
            .await
            .map_err(resolve_failure)?;
        let limit = self.config.size_limit(resolved.is_archive_entry());
        if resolved.size_bytes > limit {
            return Err(ItemError::Validation(format!(
                "Source is {} bytes, over the {} byte limit",
                resolved.size_bytes, limit
            )));
        }

        let kind = request.kind;
        if let Some(existing) = collection.valid_artifact(kind, request.item_id) {
            return Ok(Prepared::Skip {
                generated_at: existing.generated_at,
            });
        }
        if let Some(record) = self
            .adopt_existing(request, settings, folders)
            .await
        {
            return Ok(Prepared::Adopt(record));
        }

        Ok(Prepared::Generate(GenerationTask {
            slot,
            source: resolved.source,
            source_bytes: resolved.size_bytes,
            spec: RenderSpec {
                width: request.width,
                height: request.height,
                format: settings.format,
                quality: settings.quality,
                adjust_quality: kind == ArtifactKind::Cache,
            },
        }))
    }

    /// Rebuild the record of an artifact that is on disk at its expected path
    /// but missing from the collection.
    async fn adopt_existing(
        &self,
        request: &ProcessingRequest,
        settings: ArtifactSettings,
        folders: &[CacheFolder],
    ) -> Option<ArtifactRecord> {
        let format = settings.format;
        let relative =
            artifact_relative_path(request.kind, request.collection_id, request.item_id, format);
        for folder in folders {
            match self.store.size_of(&folder.path, &relative).await {
                Ok(Some(size)) if size > 0 => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(folder_id = %folder.id, error = %e, "Failed to check existing artifact");
                    continue;
                }
            }
            let data = match self.store.read(&folder.path, &relative).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(folder_id = %folder.id, error = %e, "Failed to read existing artifact");
                    continue;
                }
            };
            let Some((width, height)) = probe_dimensions(&data) else {
                continue;
            };
            tracing::debug!(
                item_id = %request.item_id,
                folder_id = %folder.id,
                "Adopting artifact found on disk"
            );
            return Some(ArtifactRecord {
                source_item_id: request.item_id,
                folder_id: folder.id,
                path: relative.to_string_lossy().into_owned(),
                width,
                height,
                size_bytes: data.len() as u64,
                format,
                quality: estimate_jpeg_quality(&data).unwrap_or(settings.quality),
                generated_at: Utc::now(),
            });
        }
        None
    }

    /// Reserve `bytes` from the shared budget. When it is exhausted, write
    /// what this batch has buffered to release our own reservations first.
    async fn reserve(&self, bytes: u64, batch: &mut BatchState) -> Result<MemoryReservation> {
        if let Some(reservation) = self.budget.try_reserve(bytes) {
            return Ok(reservation);
        }
        if !batch.buffered.is_empty() {
            tracing::debug!(
                buffered = batch.buffered.len(),
                available_bytes = self.budget.available_bytes(),
                "Memory budget exhausted, writing buffered artifacts"
            );
            self.write_buffered(batch).await;
        }
        self.budget.reserve(bytes).await
    }

    /// Allocate a folder for every buffered artifact and write them grouped by
    /// folder. Drains the buffer, releasing its memory reservations.
    async fn write_buffered(&self, batch: &mut BatchState) {
        let mut groups: BTreeMap<Uuid, (CacheFolder, Vec<Buffered>)> = BTreeMap::new();
        let buffered = std::mem::take(&mut batch.buffered);
        for item in buffered {
            match batch.allocator.allocate(item.artifact.size_bytes()) {
                Ok(folder) => groups
                    .entry(folder.id)
                    .or_insert_with(|| (folder, Vec::new()))
                    .1
                    .push(item),
                Err(e) => batch.fail(item.slot, ItemError::Destination(e.to_string())),
            }
        }

        for (folder_id, (folder, items)) in groups {
            for item in items {
                let estimated = item.artifact.size_bytes();
                let relative = artifact_relative_path(
                    batch.kind,
                    item.collection_id,
                    item.item_id,
                    item.artifact.format,
                );
                match self
                    .store
                    .write(&folder.path, &relative, &item.artifact.data)
                    .await
                {
                    Ok(written) => {
                        batch.allocator.record_written(folder_id, estimated, written);
                        batch.written += 1;
                        let record = ArtifactRecord {
                            source_item_id: item.item_id,
                            folder_id,
                            path: relative.to_string_lossy().into_owned(),
                            width: item.artifact.width,
                            height: item.artifact.height,
                            size_bytes: written,
                            format: item.artifact.format,
                            quality: item.artifact.quality,
                            generated_at: Utc::now(),
                        };
                        batch.set(item.slot, Slot::Staged(record));
                    }
                    Err(e) => {
                        batch.allocator.release(folder_id, estimated);
                        batch.fail(item.slot, ItemError::Destination(e.to_string()));
                    }
                }
            }
        }
    }

    /// One append per collection. Records of a failed append stay unacked.
    async fn persist(&self, batch: &mut BatchState) {
        let mut by_collection: BTreeMap<Uuid, (Vec<usize>, Vec<ArtifactRecord>)> = BTreeMap::new();
        for (index, (slot, delivery)) in batch.slots.iter().zip(&batch.deliveries).enumerate() {
            if let Slot::Staged(record) = slot {
                let entry = by_collection
                    .entry(delivery.request.collection_id)
                    .or_default();
                entry.0.push(index);
                entry.1.push(record.clone());
            }
        }

        for (collection_id, (indexes, records)) in by_collection {
            let persisted = match self
                .collections
                .append_artifacts(collection_id, batch.kind, &records)
                .await
            {
                Ok(merged) => {
                    tracing::debug!(collection_id = %collection_id, merged, "Artifacts persisted");
                    true
                }
                Err(e) => {
                    tracing::error!(
                        collection_id = %collection_id,
                        records = records.len(),
                        error = %e,
                        "Failed to persist artifacts, leaving them for redelivery"
                    );
                    false
                }
            };
            for index in indexes {
                batch.set(
                    index,
                    if persisted {
                        Slot::Completed
                    } else {
                        Slot::Unpersisted
                    },
                );
            }
        }
    }

    async fn record_job_outcomes(&self, batch: &BatchState) {
        let mut outcomes: BTreeMap<Uuid, JobOutcome> = BTreeMap::new();
        for (slot, delivery) in batch.slots.iter().zip(&batch.deliveries) {
            let Some(job_id) = delivery.request.job_id else {
                continue;
            };
            match slot {
                Slot::Completed | Slot::Skipped { counted: true } => {
                    outcomes.entry(job_id).or_default().record_success()
                }
                Slot::Failed(error) => outcomes
                    .entry(job_id)
                    .or_default()
                    .record_failure(error.error_type(), error.to_string()),
                _ => {}
            }
        }

        for (job_id, outcome) in outcomes {
            if let Err(e) = self.tracker.record_outcomes(job_id, &outcome).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job progress");
            }
        }
    }

    async fn flush_folder_usage(&self, allocator: &DestinationAllocator) {
        for (&folder_id, &bytes) in allocator.written_totals() {
            if bytes == 0 {
                continue;
            }
            if let Err(e) = self.folders.increment_used(folder_id, bytes).await {
                tracing::error!(folder_id = %folder_id, bytes, error = %e, "Failed to update folder usage");
            }
        }
    }
}

enum Prepared {
    Skip { generated_at: DateTime<Utc> },
    Adopt(ArtifactRecord),
    Generate(GenerationTask),
}

fn log_item_failure(request: &ProcessingRequest, error: &ItemError) {
    match error.log_level() {
        LogLevel::Debug => tracing::debug!(
            item_id = %request.item_id,
            job_id = ?request.job_id,
            error_type = %error.error_type(),
            error = %error,
            "Item failed"
        ),
        LogLevel::Warn => tracing::warn!(
            item_id = %request.item_id,
            job_id = ?request.job_id,
            error_type = %error.error_type(),
            error = %error,
            "Item failed"
        ),
        LogLevel::Error => tracing::error!(
            item_id = %request.item_id,
            job_id = ?request.job_id,
            error_type = %error.error_type(),
            error = %error,
            "Item failed"
        ),
    }
}

/// Batch settings, overridden by what the job was queued with.
fn effective_settings(
    base: ArtifactSettings,
    request: &ProcessingRequest,
    jobs: &HashMap<Uuid, JobState>,
) -> ArtifactSettings {
    let Some(job) = request.job_id.and_then(|id| jobs.get(&id)) else {
        return base;
    };
    ArtifactSettings {
        format: job.settings.format.unwrap_or(base.format),
        quality: job.settings.quality.unwrap_or(base.quality),
    }
}

fn resolve_failure(error: ResolveError) -> ItemError {
    match error {
        ResolveError::IoError(e) => ItemError::Generation(format!("Failed to stat source: {}", e)),
        other => ItemError::Validation(other.to_string()),
    }
}

fn generation_failure(error: GenerateError) -> ItemError {
    if error.is_validation() {
        ItemError::Validation(error.to_string())
    } else {
        ItemError::Generation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pictor_core::models::{JobSettings, JobType, OutputFormat};

    fn request(job_id: Option<Uuid>) -> ProcessingRequest {
        ProcessingRequest {
            kind: ArtifactKind::Cache,
            collection_id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            source: "/photos/a.jpg".into(),
            width: 1920,
            height: 1080,
            job_id,
        }
    }

    #[test]
    fn job_settings_override_batch_settings() {
        let base = ArtifactSettings {
            format: OutputFormat::Jpeg,
            quality: 85,
        };
        let job = JobState::new(
            JobType::GenerateCache,
            Uuid::new_v4(),
            1,
            JobSettings {
                width: 1920,
                height: 1080,
                quality: Some(70),
                format: None,
            },
        );
        let jobs = HashMap::from([(job.id, job.clone())]);

        let with_job = effective_settings(base, &request(Some(job.id)), &jobs);
        assert_eq!(with_job.quality, 70);
        assert_eq!(with_job.format, OutputFormat::Jpeg);
        assert_eq!(effective_settings(base, &request(None), &jobs), base);
    }

    #[test]
    fn missing_sources_are_validation_failures() {
        let error = resolve_failure(ResolveError::NotFound("/gone.png".into()));
        assert_eq!(error.error_type(), pictor_core::ErrorType::ValidationFailure);

        let io = resolve_failure(ResolveError::IoError(std::io::Error::other("EIO")));
        assert_eq!(io.error_type(), pictor_core::ErrorType::GenerationFailure);
    }

    #[test]
    fn decode_errors_are_generation_failures() {
        let error = generation_failure(GenerateError::Decode("truncated".into()));
        assert_eq!(error.error_type(), pictor_core::ErrorType::GenerationFailure);
        let error = generation_failure(GenerateError::InvalidDimensions { width: 0, height: 1 });
        assert!(!error.is_retryable());
    }
}
