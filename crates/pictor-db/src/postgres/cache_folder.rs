use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres};
use std::path::PathBuf;
use uuid::Uuid;

use pictor_core::models::CacheFolder;

use super::{bytes_to_i64, i64_to_bytes};
use crate::ports::CacheFolderRepository;

#[derive(Debug, FromRow)]
struct CacheFolderRow {
    id: Uuid,
    path: String,
    priority: i32,
    max_size_bytes: Option<i64>,
    current_size_bytes: i64,
    is_active: bool,
}

impl From<CacheFolderRow> for CacheFolder {
    fn from(row: CacheFolderRow) -> Self {
        CacheFolder {
            id: row.id,
            path: PathBuf::from(row.path),
            priority: row.priority,
            max_size_bytes: row.max_size_bytes.map(i64_to_bytes),
            current_size_bytes: i64_to_bytes(row.current_size_bytes),
            is_active: row.is_active,
        }
    }
}

#[derive(Clone)]
pub struct PgCacheFolderRepository {
    pool: PgPool,
}

impl PgCacheFolderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheFolderRepository for PgCacheFolderRepository {
    #[tracing::instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<CacheFolder>> {
        let rows = sqlx::query_as::<Postgres, CacheFolderRow>(
            r#"
            SELECT id, path, priority, max_size_bytes, current_size_bytes, is_active
            FROM cache_folders
            WHERE is_active
            ORDER BY priority ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list cache folders")?;

        Ok(rows.into_iter().map(CacheFolder::from).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn increment_used(&self, folder_id: Uuid, bytes: u64) -> Result<()> {
        sqlx::query(
            "UPDATE cache_folders SET current_size_bytes = current_size_bytes + $2 WHERE id = $1",
        )
        .bind(folder_id)
        .bind(bytes_to_i64(bytes))
        .execute(&self.pool)
        .await
        .context("Failed to increment cache folder usage")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn set_used(&self, folder_id: Uuid, bytes: u64) -> Result<()> {
        sqlx::query("UPDATE cache_folders SET current_size_bytes = $2 WHERE id = $1")
            .bind(folder_id)
            .bind(bytes_to_i64(bytes))
            .execute(&self.pool)
            .await
            .context("Failed to set cache folder usage")?;

        Ok(())
    }
}
