use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};
use uuid::Uuid;

use pictor_core::models::{ArtifactKind, ArtifactRecord, Collection, CollectionItem};

use crate::ports::CollectionRepository;

#[derive(Debug, FromRow)]
struct CollectionRow {
    id: Uuid,
    items: Json<Vec<CollectionItem>>,
    thumbnails: Json<Vec<ArtifactRecord>>,
    cache_images: Json<Vec<ArtifactRecord>>,
    version: i64,
}

impl From<CollectionRow> for Collection {
    fn from(row: CollectionRow) -> Self {
        Collection {
            id: row.id,
            items: row.items.0,
            thumbnails: row.thumbnails.0,
            cache_images: row.cache_images.0,
            version: row.version,
        }
    }
}

/// Embedded-array column for each artifact kind.
fn artifact_column(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Thumbnail => "thumbnails",
        ArtifactKind::Cache => "cache_images",
    }
}

#[derive(Clone)]
pub struct PgCollectionRepository {
    pool: PgPool,
}

impl PgCollectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, collection), fields(collection_id = %collection.id))]
    pub async fn insert(&self, collection: &Collection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collections (id, items, thumbnails, cache_images, version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(collection.id)
        .bind(Json(&collection.items))
        .bind(Json(&collection.thumbnails))
        .bind(Json(&collection.cache_images))
        .bind(collection.version)
        .execute(&self.pool)
        .await
        .context("Failed to insert collection")?;

        Ok(())
    }
}

#[async_trait]
impl CollectionRepository for PgCollectionRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, collection_id: Uuid) -> Result<Option<Collection>> {
        let row = sqlx::query_as::<Postgres, CollectionRow>(
            r#"
            SELECT id, items, thumbnails, cache_images, version
            FROM collections
            WHERE id = $1
            "#,
        )
        .bind(collection_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch collection")?;

        Ok(row.map(Collection::from))
    }

    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    async fn append_artifacts(
        &self,
        collection_id: Uuid,
        kind: ArtifactKind,
        records: &[ArtifactRecord],
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let item_ids: Vec<String> = records
            .iter()
            .map(|r| r.source_item_id.to_string())
            .collect();
        let column = artifact_column(kind);

        // One statement: drop superseded records, append the new ones.
        let sql = format!(
            r#"
            UPDATE collections
            SET {column} = (
                    SELECT COALESCE(jsonb_agg(existing), '[]'::jsonb)
                    FROM jsonb_array_elements({column}) AS existing
                    WHERE NOT (existing ->> 'source_item_id' = ANY($2))
                ) || $3::jsonb,
                version = version + 1
            WHERE id = $1
            "#
        );
        let result = sqlx::query(&sql)
            .bind(collection_id)
            .bind(&item_ids)
            .bind(Json(records))
            .execute(&self.pool)
            .await
            .context("Failed to append artifact records")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("Collection {} not found", collection_id));
        }

        tracing::debug!(
            collection_id = %collection_id,
            kind = %kind,
            count = records.len(),
            "Artifact records appended"
        );

        Ok(records.len())
    }
}
