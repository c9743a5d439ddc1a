use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::archive::{ArchiveIndex, ZipArchiveIndex};
use crate::error::ResolveError;
use crate::source::SourceRef;

/// Plain-file existence check.
#[async_trait]
pub trait FileProbe: Send + Sync {
    /// Size of a regular file, or `None` if there is no regular file at `path`.
    async fn plain_file_size(&self, path: &Path) -> std::io::Result<Option<u64>>;
}

#[derive(Debug, Clone, Default)]
pub struct FsProbe;

#[async_trait]
impl FileProbe for FsProbe {
    async fn plain_file_size(&self, path: &Path) -> std::io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Outcome of resolving a source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub source: SourceRef,
    pub size_bytes: u64,
}

impl ResolvedSource {
    pub fn is_archive_entry(&self) -> bool {
        self.source.is_archive_entry()
    }
}

/// Classifies source references and sizes them without extracting archives.
#[derive(Clone)]
pub struct PathResolver {
    probe: Arc<dyn FileProbe>,
    archives: Arc<dyn ArchiveIndex>,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(Arc::new(FsProbe), Arc::new(ZipArchiveIndex::new()))
    }
}

impl PathResolver {
    pub fn new(probe: Arc<dyn FileProbe>, archives: Arc<dyn ArchiveIndex>) -> Self {
        Self { probe, archives }
    }

    /// Classify `raw` and report its size.
    ///
    /// Archive entries are sized from the container index only; the plain-file
    /// probe is never consulted for them.
    pub async fn resolve(&self, raw: &str) -> Result<ResolvedSource, ResolveError> {
        let source = SourceRef::parse(raw)?;
        let size_bytes = match &source {
            SourceRef::Plain(path) => self
                .probe
                .plain_file_size(path)
                .await?
                .ok_or_else(|| ResolveError::NotFound(path.clone()))?,
            SourceRef::ArchiveEntry { container, entry } => {
                if !source.is_supported_container() {
                    return Err(ResolveError::UnsupportedContainer(container.clone()));
                }
                self.archives.entry_size(container, entry).await?
            }
        };

        Ok(ResolvedSource { source, size_bytes })
    }

    /// Plain-file existence check for callers that need one.
    ///
    /// Passing an archive entry is a caller bug and fails loudly instead of
    /// reporting the entry as missing.
    pub async fn ensure_plain_file_exists(&self, raw: &str) -> Result<u64, ResolveError> {
        match SourceRef::parse(raw)? {
            SourceRef::ArchiveEntry { .. } => {
                Err(ResolveError::ArchiveEntryAsPlainFile(raw.to_string()))
            }
            SourceRef::Plain(path) => self
                .probe
                .plain_file_size(&path)
                .await?
                .ok_or(ResolveError::NotFound(path)),
        }
    }

    /// Load the source bytes. Sizes are checked before anything is read.
    /// Archive entries are streamed out of their container; nothing else in
    /// the container is touched.
    pub async fn read(&self, source: &SourceRef, limit: u64) -> Result<Vec<u8>, ResolveError> {
        match source {
            SourceRef::Plain(path) => {
                let size = self
                    .probe
                    .plain_file_size(path)
                    .await?
                    .ok_or_else(|| ResolveError::NotFound(path.clone()))?;
                if size > limit {
                    return Err(ResolveError::TooLarge { size, limit });
                }
                let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
                    ErrorKind::NotFound => ResolveError::NotFound(path.clone()),
                    _ => ResolveError::IoError(e),
                })?;
                let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
                // The file may have grown since it was sized.
                file.take(limit.saturating_add(1)).read_to_end(&mut data).await?;
                let size = data.len() as u64;
                if size > limit {
                    return Err(ResolveError::TooLarge { size, limit });
                }
                Ok(data)
            }
            SourceRef::ArchiveEntry { container, entry } => {
                if !source.is_supported_container() {
                    return Err(ResolveError::UnsupportedContainer(container.clone()));
                }
                self.archives.read_entry(container, entry, limit).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProbe {
        files: HashMap<PathBuf, u64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileProbe for CountingProbe {
        async fn plain_file_size(&self, path: &Path) -> std::io::Result<Option<u64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.files.get(path).copied())
        }
    }

    struct FixedIndex(u64);

    #[async_trait]
    impl ArchiveIndex for FixedIndex {
        async fn entry_size(&self, _: &Path, _: &str) -> Result<u64, ResolveError> {
            Ok(self.0)
        }

        async fn read_entry(&self, _: &Path, _: &str, _: u64) -> Result<Vec<u8>, ResolveError> {
            Ok(vec![0; self.0 as usize])
        }
    }

    fn resolver(probe: Arc<CountingProbe>, entry_size: u64) -> PathResolver {
        PathResolver::new(probe, Arc::new(FixedIndex(entry_size)))
    }

    #[tokio::test]
    async fn archive_entries_never_hit_the_plain_file_probe() {
        let probe = Arc::new(CountingProbe::default());
        let resolver = resolver(probe.clone(), 4096);

        let resolved = resolver.resolve("container.zip#photo.png").await.unwrap();
        assert!(resolved.is_archive_entry());
        assert_eq!(resolved.size_bytes, 4096);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plain_files_are_probed() {
        let path = r"C:\Photos\photo.png";
        let probe = Arc::new(CountingProbe {
            files: HashMap::from([(PathBuf::from(path), 2048)]),
            ..Default::default()
        });
        let resolver = resolver(probe.clone(), 0);

        let resolved = resolver.resolve(path).await.unwrap();
        assert!(!resolved.is_archive_entry());
        assert_eq!(resolved.size_bytes, 2048);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plain_file_check_on_an_archive_entry_is_a_configuration_error() {
        let probe = Arc::new(CountingProbe::default());
        let resolver = resolver(probe.clone(), 1);

        let err = resolver
            .ensure_plain_file_exists("container.zip#photo.png")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ArchiveEntryAsPlainFile(_)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_plain_file_is_not_found() {
        let resolver = resolver(Arc::new(CountingProbe::default()), 0);
        assert!(matches!(
            resolver.resolve("/photos/gone.jpg").await,
            Err(ResolveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_containers_are_rejected_before_indexing() {
        let resolver = resolver(Arc::new(CountingProbe::default()), 10);
        assert!(matches!(
            resolver.resolve("/comics/a.rar#1.jpg").await,
            Err(ResolveError::UnsupportedContainer(_))
        ));
    }

    #[tokio::test]
    async fn oversized_plain_files_are_rejected_before_reading() {
        // The probe reports a size for a path with nothing on disk, so any
        // attempt to open it would surface as NotFound.
        let path = PathBuf::from("/photos/huge.tif");
        let probe = Arc::new(CountingProbe {
            files: HashMap::from([(path.clone(), 10 << 30)]),
            ..Default::default()
        });
        let resolver = resolver(probe.clone(), 0);

        let err = resolver
            .read(&SourceRef::Plain(path), 1 << 20)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::TooLarge { size, limit } if size == 10 << 30 && limit == 1 << 20
        ));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fs_probe_reads_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"12345").unwrap();

        let resolver = PathResolver::default();
        let resolved = resolver.resolve(path.to_str().unwrap()).await.unwrap();
        assert_eq!(resolved.size_bytes, 5);
        assert_eq!(
            resolver.read(&resolved.source, 5).await.unwrap(),
            b"12345".to_vec()
        );
        assert!(resolver.read(&resolved.source, 4).await.is_err());
    }
}
