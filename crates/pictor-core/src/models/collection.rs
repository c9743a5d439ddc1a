use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::artifact::{ArtifactKind, ArtifactRecord};

/// One source item of a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionItem {
    pub id: Uuid,
    /// Plain path or `container#entry` reference.
    pub source: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Collection document. Artifacts live embedded in it rather than in their own table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collection {
    pub id: Uuid,
    pub items: Vec<CollectionItem>,
    pub thumbnails: Vec<ArtifactRecord>,
    pub cache_images: Vec<ArtifactRecord>,
    pub version: i64,
}

impl Collection {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn artifacts(&self, kind: ArtifactKind) -> &[ArtifactRecord] {
        match kind {
            ArtifactKind::Thumbnail => &self.thumbnails,
            ArtifactKind::Cache => &self.cache_images,
        }
    }

    fn artifacts_mut(&mut self, kind: ArtifactKind) -> &mut Vec<ArtifactRecord> {
        match kind {
            ArtifactKind::Thumbnail => &mut self.thumbnails,
            ArtifactKind::Cache => &mut self.cache_images,
        }
    }

    pub fn item(&self, item_id: Uuid) -> Option<&CollectionItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    /// Valid artifact of `kind` for `item_id`, if one is recorded.
    pub fn valid_artifact(&self, kind: ArtifactKind, item_id: Uuid) -> Option<&ArtifactRecord> {
        self.artifacts(kind)
            .iter()
            .find(|record| record.source_item_id == item_id && record.is_valid())
    }

    /// Items that have no valid artifact of `kind`.
    pub fn missing_items(&self, kind: ArtifactKind) -> Vec<&CollectionItem> {
        let done: HashSet<Uuid> = self
            .artifacts(kind)
            .iter()
            .filter(|record| record.is_valid())
            .map(|record| record.source_item_id)
            .collect();
        self.items
            .iter()
            .filter(|item| !done.contains(&item.id))
            .collect()
    }

    /// Merge `records` into the embedded array of `kind`, replacing any existing
    /// record for the same source item. Returns the number of records merged.
    pub fn merge_artifacts(&mut self, kind: ArtifactKind, records: &[ArtifactRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let incoming: HashSet<Uuid> = records.iter().map(|r| r.source_item_id).collect();
        let target = self.artifacts_mut(kind);
        target.retain(|existing| !incoming.contains(&existing.source_item_id));
        target.extend_from_slice(records);
        self.version += 1;
        records.len()
    }
}
