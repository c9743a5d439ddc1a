//! Storage side of the artifact pipeline.
//!
//! # Source references
//!
//! A source is either a plain filesystem path or an archive entry written as
//! `container#entry`, e.g. `/comics/vol1.cbz#003.png`. Archive entries are
//! sized and read through the container's index, never extracted to disk and
//! never run through a plain-file existence check.
//!
//! # Artifact layout
//!
//! Artifacts live at `<folder>/<kind dir>/<collection_id>/<item_id>.<ext>`,
//! so the expected path of an artifact is known without a database lookup.

pub mod allocator;
pub mod archive;
pub mod error;
pub mod layout;
pub mod local;
pub mod resolver;
pub mod source;

pub use allocator::DestinationAllocator;
pub use archive::{ArchiveIndex, ZipArchiveIndex};
pub use error::{ResolveError, StorageError, StorageResult};
pub use layout::artifact_relative_path;
pub use local::{folder_disk_usage, ArtifactStore, LocalArtifactStore};
pub use resolver::{FileProbe, FsProbe, PathResolver, ResolvedSource};
pub use source::SourceRef;
