use async_trait::async_trait;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::ResolveError;

/// Read access to a container's entry index.
#[async_trait]
pub trait ArchiveIndex: Send + Sync {
    /// Uncompressed size of one entry, read from the index without extracting.
    async fn entry_size(&self, container: &Path, entry: &str) -> Result<u64, ResolveError>;

    /// Stream a single entry into memory. Entries larger than `limit` are refused.
    async fn read_entry(
        &self,
        container: &Path,
        entry: &str,
        limit: u64,
    ) -> Result<Vec<u8>, ResolveError>;
}

/// Zip-family containers (`.zip`, `.cbz`).
#[derive(Debug, Clone, Default)]
pub struct ZipArchiveIndex;

impl ZipArchiveIndex {
    pub fn new() -> Self {
        Self
    }
}

fn open(container: &Path) -> Result<ZipArchive<File>, ResolveError> {
    let file = File::open(container).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ResolveError::ContainerNotFound(container.to_path_buf()),
        _ => ResolveError::IoError(e),
    })?;
    ZipArchive::new(file).map_err(|e| ResolveError::Archive(e.to_string()))
}

/// Zip entry names always use forward slashes.
fn normalize_entry(entry: &str) -> String {
    entry.replace('\\', "/")
}

fn entry_error(container: &Path, entry: &str, error: ZipError) -> ResolveError {
    match error {
        ZipError::FileNotFound => ResolveError::EntryNotFound {
            container: container.to_path_buf(),
            entry: entry.to_string(),
        },
        ZipError::Io(e) => ResolveError::IoError(e),
        other => ResolveError::Archive(other.to_string()),
    }
}

fn blocking_entry_size(container: PathBuf, entry: String) -> Result<u64, ResolveError> {
    let mut archive = open(&container)?;
    let file = archive
        .by_name(&normalize_entry(&entry))
        .map_err(|e| entry_error(&container, &entry, e))?;
    Ok(file.size())
}

fn blocking_read_entry(container: PathBuf, entry: String, limit: u64) -> Result<Vec<u8>, ResolveError> {
    let mut archive = open(&container)?;
    let file = archive
        .by_name(&normalize_entry(&entry))
        .map_err(|e| entry_error(&container, &entry, e))?;
    let size = file.size();
    if size > limit {
        return Err(ResolveError::TooLarge { size, limit });
    }
    let mut buffer = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    // Bound the read by the declared size in case the index lies.
    file.take(limit).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[async_trait]
impl ArchiveIndex for ZipArchiveIndex {
    async fn entry_size(&self, container: &Path, entry: &str) -> Result<u64, ResolveError> {
        let container = container.to_path_buf();
        let entry = entry.to_string();
        tokio::task::spawn_blocking(move || blocking_entry_size(container, entry))
            .await
            .map_err(|e| ResolveError::Archive(format!("Archive index task failed: {}", e)))?
    }

    async fn read_entry(
        &self,
        container: &Path,
        entry: &str,
        limit: u64,
    ) -> Result<Vec<u8>, ResolveError> {
        let container = container.to_path_buf();
        let entry = entry.to_string();
        let start = std::time::Instant::now();
        let data = tokio::task::spawn_blocking({
            let container = container.clone();
            let entry = entry.clone();
            move || blocking_read_entry(container, entry, limit)
        })
        .await
        .map_err(|e| ResolveError::Archive(format!("Archive read task failed: {}", e)))??;

        tracing::debug!(
            container = %container.display(),
            entry = %entry,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Archive entry read"
        );

        Ok(data)
    }
}
