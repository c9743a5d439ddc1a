use anyhow::{Context, Result};
use uuid::Uuid;

use pictor_db::CacheFolderRepository;
use pictor_storage::folder_disk_usage;

/// Walk every active cache folder and overwrite its recorded usage with what
/// is actually on disk. Returns the recounted sizes.
#[tracing::instrument(skip(folders))]
pub async fn recount_folder_usage(folders: &dyn CacheFolderRepository) -> Result<Vec<(Uuid, u64)>> {
    let active = folders
        .list_active()
        .await
        .context("Failed to list cache folders")?;

    let mut recounted = Vec::with_capacity(active.len());
    for folder in active {
        let used = folder_disk_usage(&folder.path)
            .await
            .with_context(|| format!("Failed to measure {}", folder.path.display()))?;
        folders.set_used(folder.id, used).await?;
        if used != folder.current_size_bytes {
            tracing::info!(
                folder_id = %folder.id,
                recorded = folder.current_size_bytes,
                actual = used,
                "Cache folder usage corrected"
            );
        }
        recounted.push((folder.id, used));
    }
    Ok(recounted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pictor_core::models::CacheFolder;
    use pictor_db::memory::MemoryCacheFolderRepository;

    #[tokio::test]
    async fn recount_overwrites_drifted_usage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cache/c1")).unwrap();
        std::fs::write(dir.path().join("cache/c1/a.jpg"), vec![0u8; 300]).unwrap();

        let folder = CacheFolder {
            id: Uuid::new_v4(),
            path: dir.path().to_path_buf(),
            priority: 1,
            max_size_bytes: Some(10_000),
            current_size_bytes: 9_000,
            is_active: true,
        };
        let repo = MemoryCacheFolderRepository::new(vec![folder.clone()]);

        let recounted = recount_folder_usage(&repo).await.unwrap();
        assert_eq!(recounted, vec![(folder.id, 300)]);
        assert_eq!(repo.folder(folder.id).unwrap().unwrap().current_size_bytes, 300);
    }
}
