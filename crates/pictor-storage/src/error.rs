use std::path::PathBuf;
use thiserror::Error;

/// Cache-folder write and read errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("No active cache folder is registered")]
    NoActiveFolder,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors resolving or reading a source reference
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Source reference is empty")]
    EmptyReference,

    #[error("Source file not found: {0}")]
    NotFound(PathBuf),

    /// A caller ran the plain-file existence check on an archive entry.
    /// This is a wiring bug, not a data problem.
    #[error("Archive entry '{0}' was checked as a plain file")]
    ArchiveEntryAsPlainFile(String),

    #[error("Archive container not found: {0}")]
    ContainerNotFound(PathBuf),

    #[error("Entry '{entry}' not found in archive {container}")]
    EntryNotFound { container: PathBuf, entry: String },

    #[error("Unsupported archive container: {0}")]
    UnsupportedContainer(PathBuf),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Source is {size} bytes, over the {limit} byte read limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
