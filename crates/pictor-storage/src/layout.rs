use std::path::PathBuf;
use uuid::Uuid;

use pictor_core::models::{ArtifactKind, OutputFormat};

/// Path of an artifact relative to its cache folder:
/// `<kind dir>/<collection_id>/<item_id>.<ext>`.
pub fn artifact_relative_path(
    kind: ArtifactKind,
    collection_id: Uuid,
    item_id: Uuid,
    format: OutputFormat,
) -> PathBuf {
    PathBuf::from(kind.directory())
        .join(collection_id.to_string())
        .join(format!("{}.{}", item_id, format.extension()))
}
