use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Registered destination folder for generated artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheFolder {
    pub id: Uuid,
    pub path: PathBuf,
    /// Lower is preferred.
    pub priority: i32,
    /// `None` means unbounded.
    pub max_size_bytes: Option<u64>,
    pub current_size_bytes: u64,
    pub is_active: bool,
}

impl CacheFolder {
    /// Whether `additional_bytes` fit under the soft size cap.
    pub fn has_headroom(&self, additional_bytes: u64) -> bool {
        match self.max_size_bytes {
            None => true,
            Some(max) => self
                .current_size_bytes
                .checked_add(additional_bytes)
                .is_some_and(|total| total <= max),
        }
    }
}
