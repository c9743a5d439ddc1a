//! Component configuration, derived from the process-wide [`Config`].

use std::time::Duration;

use pictor_core::constants::{
    DEFAULT_CACHE_BATCH_SIZE, DEFAULT_CACHE_QUALITY, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_MEMORY_BUDGET_BYTES, DEFAULT_QUEUE_CAPACITY, DEFAULT_RECOVERY_INTERVAL,
    DEFAULT_STALE_JOB_TIMEOUT, DEFAULT_THUMBNAIL_BATCH_SIZE, DEFAULT_THUMBNAIL_QUALITY,
    MAX_ARCHIVE_ENTRY_BYTES, MAX_PLAIN_FILE_BYTES,
    STALE_JOB_FAIL_MULTIPLIER, VISIBILITY_RETRY_ATTEMPTS, VISIBILITY_RETRY_DELAY,
};
use pictor_core::models::{ArtifactKind, ArtifactSettings, OutputFormat};
use pictor_core::Config;

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub thumbnail_batch_size: usize,
    pub cache_batch_size: usize,
    /// Hard cap per kind; `add` rejects beyond it.
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    /// Flushed windows that may wait for a consumer before flushing pauses.
    pub max_pending_windows: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            thumbnail_batch_size: DEFAULT_THUMBNAIL_BATCH_SIZE,
            cache_batch_size: DEFAULT_CACHE_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_pending_windows: 8,
        }
    }
}

impl AccumulatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            thumbnail_batch_size: config.batch_thumbnail_size,
            cache_batch_size: config.batch_cache_size,
            queue_capacity: config.batch_queue_capacity,
            flush_interval: config.flush_interval(),
            max_pending_windows: config.worker_max_concurrent_batches.max(1) * 2,
        }
    }

    pub fn base_batch_size(&self, kind: ArtifactKind) -> usize {
        match kind {
            ArtifactKind::Thumbnail => self.thumbnail_batch_size,
            ArtifactKind::Cache => self.cache_batch_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_plain_file_bytes: u64,
    pub max_archive_entry_bytes: u64,
    /// Total lookups of a collection that is not visible yet, first one included.
    pub visibility_retry_attempts: u32,
    pub visibility_retry_delay: Duration,
    pub default_format: OutputFormat,
    pub default_thumbnail_quality: u8,
    pub default_cache_quality: u8,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_plain_file_bytes: MAX_PLAIN_FILE_BYTES,
            max_archive_entry_bytes: MAX_ARCHIVE_ENTRY_BYTES,
            visibility_retry_attempts: VISIBILITY_RETRY_ATTEMPTS,
            visibility_retry_delay: VISIBILITY_RETRY_DELAY,
            default_format: OutputFormat::default(),
            default_thumbnail_quality: DEFAULT_THUMBNAIL_QUALITY,
            default_cache_quality: DEFAULT_CACHE_QUALITY,
        }
    }
}

impl ConsumerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_plain_file_bytes: config.max_plain_file_bytes,
            max_archive_entry_bytes: config.max_archive_entry_bytes,
            visibility_retry_attempts: config.visibility_retry_attempts,
            visibility_retry_delay: config.visibility_retry_delay(),
            default_format: config.default_output_format,
            default_thumbnail_quality: config.default_thumbnail_quality,
            default_cache_quality: config.default_cache_quality,
        }
    }

    /// Settings used when the settings store has nothing for `kind`.
    pub fn default_settings(&self, kind: ArtifactKind) -> ArtifactSettings {
        let quality = match kind {
            ArtifactKind::Thumbnail => self.default_thumbnail_quality,
            ArtifactKind::Cache => self.default_cache_quality,
        };
        ArtifactSettings {
            format: self.default_format,
            quality,
        }
    }

    pub fn size_limit(&self, is_archive_entry: bool) -> u64 {
        if is_archive_entry {
            self.max_archive_entry_bytes
        } else {
            self.max_plain_file_bytes
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    /// `T`: jobs without progress for longer than this are stale.
    pub stale_timeout: Duration,
    /// Stale jobs older than `fail_multiplier * T` are failed instead of resumed.
    pub fail_multiplier: f64,
    /// Upper bound on jobs handled per sweep.
    pub sweep_limit: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECOVERY_INTERVAL,
            stale_timeout: DEFAULT_STALE_JOB_TIMEOUT,
            fail_multiplier: STALE_JOB_FAIL_MULTIPLIER,
            sweep_limit: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.recovery_interval(),
            stale_timeout: config.stale_job_timeout(),
            fail_multiplier: config.stale_job_fail_multiplier,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_interval: Duration,
    pub receive_batch: usize,
    pub max_concurrent_batches: usize,
    pub unhealthy_lag: usize,
    pub unhealthy_error_rate: f64,
    pub memory_budget_bytes: u64,
    pub recovery_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            receive_batch: 200,
            max_concurrent_batches: 4,
            unhealthy_lag: 8,
            unhealthy_error_rate: 0.25,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            recovery_enabled: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            receive_batch: config.worker_receive_batch,
            max_concurrent_batches: config.worker_max_concurrent_batches,
            unhealthy_lag: config.batch_unhealthy_lag,
            unhealthy_error_rate: config.batch_unhealthy_error_rate,
            memory_budget_bytes: config.memory_budget_bytes,
            recovery_enabled: true,
        }
    }
}
