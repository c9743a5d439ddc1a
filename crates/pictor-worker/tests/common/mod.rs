#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use pictor_core::constants::FAILURE_ALERT_EVERY;
use pictor_core::models::{
    ArtifactKind, CacheFolder, Collection, CollectionItem, Delivery, DeliveryId, JobSettings,
    JobState, JobType, ProcessingRequest,
};
use pictor_db::memory::{
    MemoryCacheFolderRepository, MemoryCollectionRepository, MemoryJobRepository,
    StaticSettingsRepository,
};
use pictor_processing::{
    ArtifactGenerator, GenerateError, GeneratedArtifact, ImageArtifactGenerator, RenderSpec,
};
use pictor_storage::{
    ArtifactStore, LocalArtifactStore, PathResolver, SourceRef, StorageResult,
};
use pictor_worker::{BatchConsumer, BatchWindow, ConsumerConfig, JobTracker, MemoryBudget};

pub fn create_test_image(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Generator wrapper that counts calls.
pub struct CountingGenerator {
    inner: ImageArtifactGenerator,
    calls: AtomicUsize,
}

impl CountingGenerator {
    pub fn new() -> Self {
        Self {
            inner: ImageArtifactGenerator::new(PathResolver::default(), 1 << 30, 1 << 30),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactGenerator for CountingGenerator {
    async fn generate(
        &self,
        source: &SourceRef,
        spec: &RenderSpec,
    ) -> Result<GeneratedArtifact, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(source, spec).await
    }
}

/// Store wrapper that counts writes.
pub struct CountingStore {
    inner: LocalArtifactStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: LocalArtifactStore::new(),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for CountingStore {
    async fn write(&self, folder: &Path, relative: &Path, data: &[u8]) -> StorageResult<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(folder, relative, data).await
    }

    async fn size_of(&self, folder: &Path, relative: &Path) -> StorageResult<Option<u64>> {
        self.inner.size_of(folder, relative).await
    }

    async fn read(&self, folder: &Path, relative: &Path) -> StorageResult<Vec<u8>> {
        self.inner.read(folder, relative).await
    }
}

pub fn folder(path: PathBuf, priority: i32, max: Option<u64>, current: u64) -> CacheFolder {
    CacheFolder {
        id: Uuid::new_v4(),
        path,
        priority,
        max_size_bytes: max,
        current_size_bytes: current,
        is_active: true,
    }
}

/// One collection of PNG sources on disk, one job over all of it, and the
/// in-memory stores around them.
pub struct Harness {
    pub dir: TempDir,
    pub jobs: Arc<MemoryJobRepository>,
    pub collections: Arc<MemoryCollectionRepository>,
    pub folders: Arc<MemoryCacheFolderRepository>,
    pub settings: Arc<StaticSettingsRepository>,
    pub generator: Arc<CountingGenerator>,
    pub store: Arc<CountingStore>,
    pub collection: Collection,
    pub job: JobState,
    pub config: ConsumerConfig,
    next_delivery: AtomicUsize,
}

impl Harness {
    pub fn new(items: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let folders = vec![folder(dir.path().join("cache-a"), 1, None, 0)];
        Self::with_folders(dir, items, folders)
    }

    pub fn with_folders(dir: TempDir, items: usize, folders: Vec<CacheFolder>) -> Self {
        let sources = dir.path().join("sources");
        std::fs::create_dir_all(&sources).unwrap();
        let png = create_test_image(48, 32);

        let mut collection = Collection::new(Uuid::new_v4());
        for i in 0..items {
            let path = sources.join(format!("{i:04}.png"));
            std::fs::write(&path, &png).unwrap();
            collection.items.push(CollectionItem {
                id: Uuid::new_v4(),
                source: path.to_string_lossy().into_owned(),
                width: Some(48),
                height: Some(32),
            });
        }

        let collections = Arc::new(MemoryCollectionRepository::new());
        collections.insert(collection.clone()).unwrap();

        let job = JobState::new(
            JobType::GenerateThumbnails,
            collection.id,
            items as i64,
            JobSettings {
                width: 16,
                height: 16,
                quality: None,
                format: None,
            },
        );
        let jobs = Arc::new(MemoryJobRepository::new());
        jobs.insert(job.clone()).unwrap();

        let config = ConsumerConfig {
            visibility_retry_delay: Duration::from_millis(5),
            ..ConsumerConfig::default()
        };

        Self {
            dir,
            jobs,
            collections,
            folders: Arc::new(MemoryCacheFolderRepository::new(folders)),
            settings: Arc::new(StaticSettingsRepository::new()),
            generator: Arc::new(CountingGenerator::new()),
            store: Arc::new(CountingStore::new()),
            collection,
            job,
            config,
            next_delivery: AtomicUsize::new(1),
        }
    }

    /// Replace the source of item `index` with `bytes` of garbage.
    pub fn inflate_source(&self, index: usize, bytes: usize) {
        let item = &self.collection.items[index];
        std::fs::write(&item.source, vec![0u8; bytes]).unwrap();
    }

    pub fn consumer(&self) -> BatchConsumer {
        BatchConsumer::new(
            JobTracker::new(self.jobs.clone(), FAILURE_ALERT_EVERY),
            self.collections.clone(),
            self.folders.clone(),
            self.settings.clone(),
            PathResolver::default(),
            self.generator.clone(),
            self.store.clone(),
            MemoryBudget::new(64 * 1024 * 1024),
            self.config.clone(),
        )
    }

    pub fn requests(&self) -> Vec<ProcessingRequest> {
        self.collection
            .items
            .iter()
            .map(|item| ProcessingRequest {
                kind: ArtifactKind::Thumbnail,
                collection_id: self.collection.id,
                item_id: item.id,
                source: item.source.clone(),
                width: 16,
                height: 16,
                job_id: Some(self.job.id),
            })
            .collect()
    }

    pub fn window(&self, requests: Vec<ProcessingRequest>) -> BatchWindow {
        let deliveries = requests
            .into_iter()
            .map(|request| Delivery {
                id: DeliveryId(self.next_delivery.fetch_add(1, Ordering::SeqCst) as i64),
                request,
                attempts: 1,
            })
            .collect();
        BatchWindow {
            kind: ArtifactKind::Thumbnail,
            deliveries,
            opened_at: std::time::Instant::now(),
        }
    }

    pub async fn job_state(&self) -> JobState {
        use pictor_db::JobRepository;
        self.jobs.get(self.job.id).await.unwrap().unwrap()
    }

    pub async fn collection_state(&self) -> Collection {
        use pictor_db::CollectionRepository;
        self.collections
            .get(self.collection.id)
            .await
            .unwrap()
            .unwrap()
    }
}
