use std::collections::BTreeMap;
use uuid::Uuid;

use pictor_core::models::CacheFolder;

use crate::error::{StorageError, StorageResult};

/// Picks a destination folder for each artifact of one batch.
///
/// Works on a snapshot of the registry taken at the start of the batch.
/// Reservations made during the batch are applied to the snapshot so a single
/// batch cannot overfill a folder it already filled. Actual written sizes are
/// collected per folder and flushed to the registry once per batch.
#[derive(Debug, Clone)]
pub struct DestinationAllocator {
    folders: Vec<CacheFolder>,
    written: BTreeMap<Uuid, u64>,
}

impl DestinationAllocator {
    pub fn new(folders: Vec<CacheFolder>) -> Self {
        let mut folders: Vec<CacheFolder> = folders.into_iter().filter(|f| f.is_active).collect();
        folders.sort_by_key(|f| (f.priority, f.id));
        Self {
            folders,
            written: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// First folder by priority with room for `estimated_bytes`; unbounded
    /// folders always have room. When no folder has room the highest-priority
    /// active folder is returned anyway. Fails only with no active folder.
    pub fn allocate(&mut self, estimated_bytes: u64) -> StorageResult<CacheFolder> {
        let index = self
            .folders
            .iter()
            .position(|f| f.has_headroom(estimated_bytes))
            .unwrap_or(0);
        let folder = self
            .folders
            .get_mut(index)
            .ok_or(StorageError::NoActiveFolder)?;

        if index == 0 && !folder.has_headroom(estimated_bytes) {
            tracing::warn!(
                folder_id = %folder.id,
                current_size_bytes = folder.current_size_bytes,
                max_size_bytes = ?folder.max_size_bytes,
                estimated_bytes,
                "All cache folders are over budget, using highest-priority folder"
            );
        }

        folder.current_size_bytes = folder.current_size_bytes.saturating_add(estimated_bytes);
        Ok(folder.clone())
    }

    /// Replace the reservation for a completed write with the real size.
    pub fn record_written(&mut self, folder_id: Uuid, estimated_bytes: u64, actual_bytes: u64) {
        if let Some(folder) = self.folders.iter_mut().find(|f| f.id == folder_id) {
            folder.current_size_bytes = folder
                .current_size_bytes
                .saturating_sub(estimated_bytes)
                .saturating_add(actual_bytes);
        }
        *self.written.entry(folder_id).or_insert(0) += actual_bytes;
    }

    /// Drop the reservation of a write that did not happen.
    pub fn release(&mut self, folder_id: Uuid, estimated_bytes: u64) {
        if let Some(folder) = self.folders.iter_mut().find(|f| f.id == folder_id) {
            folder.current_size_bytes = folder.current_size_bytes.saturating_sub(estimated_bytes);
        }
    }

    /// Bytes written per folder during this batch.
    pub fn written_totals(&self) -> &BTreeMap<Uuid, u64> {
        &self.written
    }

    /// Active folders in priority order.
    pub fn folders(&self) -> &[CacheFolder] {
        &self.folders
    }

    pub fn folder(&self, folder_id: Uuid) -> Option<&CacheFolder> {
        self.folders.iter().find(|f| f.id == folder_id)
    }
}
