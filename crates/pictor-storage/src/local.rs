use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

/// Artifact files inside registered cache folders.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `data` at `relative` under `folder`, replacing any previous file.
    /// Returns the number of bytes written.
    async fn write(&self, folder: &Path, relative: &Path, data: &[u8]) -> StorageResult<u64>;

    /// Size of the file at `relative`, or `None` if it does not exist.
    async fn size_of(&self, folder: &Path, relative: &Path) -> StorageResult<Option<u64>>;

    async fn read(&self, folder: &Path, relative: &Path) -> StorageResult<Vec<u8>>;
}

/// Local filesystem store. Files are written to a temporary sibling and
/// renamed into place, so a crash never leaves a truncated artifact at the
/// path the idempotency check looks at.
#[derive(Debug, Clone, Default)]
pub struct LocalArtifactStore;

impl LocalArtifactStore {
    pub fn new() -> Self {
        Self
    }

    /// Join `relative` onto `folder`, refusing anything that could escape it.
    fn resolve(folder: &Path, relative: &Path) -> StorageResult<PathBuf> {
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath(relative.display().to_string()));
        }
        Ok(folder.join(relative))
    }

    async fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn write(&self, folder: &Path, relative: &Path, data: &[u8]) -> StorageResult<u64> {
        let path = Self::resolve(folder, relative)?;
        Self::ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&tmp).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to create file {}: {}", tmp.display(), e))
        })?;
        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::WriteFailed(format!(
                "Failed to write file {}: {}",
                tmp.display(),
                e
            )));
        }

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::WriteFailed(format!(
                "Failed to move file into place at {}: {}",
                path.display(),
                e
            )));
        }

        tracing::debug!(
            path = %path.display(),
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Artifact written"
        );

        Ok(data.len() as u64)
    }

    async fn size_of(&self, folder: &Path, relative: &Path) -> StorageResult<Option<u64>> {
        let path = Self::resolve(folder, relative)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::IoError(e)),
        }
    }

    async fn read(&self, folder: &Path, relative: &Path) -> StorageResult<Vec<u8>> {
        let path = Self::resolve(folder, relative)?;
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
            _ => StorageError::ReadFailed(format!("Failed to read file {}: {}", path.display(), e)),
        })
    }
}

/// Total size of all regular files under `root`. A missing root counts as empty.
pub async fn folder_disk_usage(root: &Path) -> StorageResult<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(StorageError::IoError(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total = total.saturating_add(entry.metadata().await?.len());
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_stat_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new();
        let relative = Path::new("thumbnails/c1/i1.jpg");

        assert_eq!(store.size_of(dir.path(), relative).await.unwrap(), None);
        let written = store.write(dir.path(), relative, b"jpeg-bytes").await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(store.size_of(dir.path(), relative).await.unwrap(), Some(10));
        assert_eq!(store.read(dir.path(), relative).await.unwrap(), b"jpeg-bytes");

        // No temporary files are left behind.
        let siblings: Vec<_> = std::fs::read_dir(dir.path().join("thumbnails/c1"))
            .unwrap()
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[tokio::test]
    async fn paths_escaping_the_folder_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new();

        for bad in ["../outside.jpg", "/etc/passwd", ""] {
            assert!(matches!(
                store.write(dir.path(), Path::new(bad), b"x").await,
                Err(StorageError::InvalidPath(_))
            ));
        }
    }

    #[tokio::test]
    async fn disk_usage_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new();
        store.write(dir.path(), Path::new("thumbnails/a/1.jpg"), &[0; 100]).await.unwrap();
        store.write(dir.path(), Path::new("cache/b/2.jpg"), &[0; 50]).await.unwrap();

        assert_eq!(folder_disk_usage(dir.path()).await.unwrap(), 150);
        assert_eq!(folder_disk_usage(&dir.path().join("missing")).await.unwrap(), 0);
    }
}
