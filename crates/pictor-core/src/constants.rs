//! Pipeline-wide defaults.

use std::time::Duration;

/// Separator between a container path and the entry name inside it (`photos.zip#a.png`).
pub const ARCHIVE_ENTRY_SEPARATOR: char = '#';

/// Container extensions recognised in front of [`ARCHIVE_ENTRY_SEPARATOR`].
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "cbz", "7z", "cb7", "rar", "cbr", "tar"];

/// Size ceiling for plain files on disk.
pub const MAX_PLAIN_FILE_BYTES: u64 = 500 * 1024 * 1024;

/// Size ceiling for archive entries. Container members are validated when the
/// container is registered, so the ceiling is much looser than for plain files.
pub const MAX_ARCHIVE_ENTRY_BYTES: u64 = 20 * 1024 * 1024 * 1024;

/// Hard cap on requests waiting in one accumulator queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

pub const DEFAULT_THUMBNAIL_BATCH_SIZE: usize = 100;
pub const DEFAULT_CACHE_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Global cap for in-flight artifact buffers across all consumers.
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Total lookup attempts for a collection record that is not visible yet.
pub const VISIBILITY_RETRY_ATTEMPTS: u32 = 3;
pub const VISIBILITY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// An alert-level log entry is emitted every this many failures on one job.
pub const FAILURE_ALERT_EVERY: i64 = 10;

/// Stale jobs older than `multiplier * timeout` are failed instead of resumed.
pub const STALE_JOB_FAIL_MULTIPLIER: f64 = 3.0;
pub const DEFAULT_STALE_JOB_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lower bound for the cache quality-adjustment heuristic.
pub const MIN_CACHE_QUALITY: u8 = 30;

pub const DEFAULT_THUMBNAIL_QUALITY: u8 = 80;
pub const DEFAULT_CACHE_QUALITY: u8 = 85;
