use async_trait::async_trait;

use pictor_storage::{PathResolver, SourceRef};

use crate::error::GenerateError;
use crate::render::{render, GeneratedArtifact, RenderSpec};

/// Produces artifact bytes for one source reference.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(
        &self,
        source: &SourceRef,
        spec: &RenderSpec,
    ) -> Result<GeneratedArtifact, GenerateError>;
}

/// Loads the source through a [`PathResolver`] (streaming archive entries out
/// of their container) and renders it on the blocking pool.
#[derive(Clone)]
pub struct ImageArtifactGenerator {
    resolver: PathResolver,
    max_plain_file_bytes: u64,
    max_archive_entry_bytes: u64,
}

impl ImageArtifactGenerator {
    pub fn new(
        resolver: PathResolver,
        max_plain_file_bytes: u64,
        max_archive_entry_bytes: u64,
    ) -> Self {
        Self {
            resolver,
            max_plain_file_bytes,
            max_archive_entry_bytes,
        }
    }

    fn read_limit(&self, source: &SourceRef) -> u64 {
        if source.is_archive_entry() {
            self.max_archive_entry_bytes
        } else {
            self.max_plain_file_bytes
        }
    }
}

#[async_trait]
impl ArtifactGenerator for ImageArtifactGenerator {
    #[tracing::instrument(skip(self, spec), fields(source = %source))]
    async fn generate(
        &self,
        source: &SourceRef,
        spec: &RenderSpec,
    ) -> Result<GeneratedArtifact, GenerateError> {
        let start = std::time::Instant::now();
        let data = self.resolver.read(source, self.read_limit(source)).await?;
        let source_bytes = data.len();
        let spec = *spec;

        let artifact = tokio::task::spawn_blocking(move || render(&data, &spec))
            .await
            .map_err(|e| GenerateError::Task(e.to_string()))??;

        tracing::debug!(
            source_bytes,
            artifact_bytes = artifact.data.len(),
            width = artifact.width,
            height = artifact.height,
            quality = artifact.quality,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Artifact generated"
        );

        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use pictor_core::models::OutputFormat;
    use pictor_storage::ResolveError;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([0, 0, 255, 255]));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn thumbnail_spec() -> RenderSpec {
        RenderSpec {
            width: 32,
            height: 32,
            format: OutputFormat::Jpeg,
            quality: 80,
            adjust_quality: false,
        }
    }

    #[tokio::test]
    async fn generates_from_an_archive_entry() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("book.cbz");
        let mut zip = ZipWriter::new(std::fs::File::create(&container).unwrap());
        zip.start_file("pages/001.png", FileOptions::default()).unwrap();
        zip.write_all(&png(128, 64)).unwrap();
        zip.finish().unwrap();

        let generator = ImageArtifactGenerator::new(PathResolver::default(), 1 << 20, 1 << 20);
        let source = SourceRef::parse(&format!("{}#pages/001.png", container.display())).unwrap();
        let artifact = generator.generate(&source, &thumbnail_spec()).await.unwrap();

        assert_eq!((artifact.width, artifact.height), (32, 16));
    }

    #[tokio::test]
    async fn each_source_kind_reads_under_its_own_limit() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = png(64, 64);
        let size = bytes.len() as u64;
        let plain = dir.path().join("photo.png");
        std::fs::write(&plain, &bytes).unwrap();
        let container = dir.path().join("album.zip");
        let mut zip = ZipWriter::new(std::fs::File::create(&container).unwrap());
        zip.start_file("photo.png", FileOptions::default()).unwrap();
        zip.write_all(&bytes).unwrap();
        zip.finish().unwrap();

        let plain = SourceRef::parse(plain.to_str().unwrap()).unwrap();
        let entry = SourceRef::parse(&format!("{}#photo.png", container.display())).unwrap();

        let generator = ImageArtifactGenerator::new(PathResolver::default(), size - 1, size);
        assert!(matches!(
            generator.generate(&plain, &thumbnail_spec()).await,
            Err(GenerateError::Source(ResolveError::TooLarge { .. }))
        ));
        assert!(generator.generate(&entry, &thumbnail_spec()).await.is_ok());

        let generator = ImageArtifactGenerator::new(PathResolver::default(), size, size - 1);
        assert!(generator.generate(&plain, &thumbnail_spec()).await.is_ok());
        assert!(matches!(
            generator.generate(&entry, &thumbnail_spec()).await,
            Err(GenerateError::Source(ResolveError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn missing_plain_source_is_a_source_error() {
        let generator = ImageArtifactGenerator::new(PathResolver::default(), 1 << 20, 1 << 20);
        let source = SourceRef::parse("/definitely/not/here.png").unwrap();
        let err = generator.generate(&source, &thumbnail_spec()).await.unwrap_err();
        assert!(matches!(err, GenerateError::Source(_)));
    }
}
