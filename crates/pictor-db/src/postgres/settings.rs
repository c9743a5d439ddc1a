use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres};

use pictor_core::models::{ArtifactKind, ArtifactSettings};

use crate::ports::SettingsRepository;

#[derive(Debug, FromRow)]
struct SettingsRow {
    format: String,
    quality: i16,
}

/// Per-kind output settings stored in `artifact_settings`.
#[derive(Clone)]
pub struct PgSettingsRepository {
    pool: PgPool,
}

impl PgSettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    #[tracing::instrument(skip(self))]
    async fn artifact_settings(&self, kind: ArtifactKind) -> Result<Option<ArtifactSettings>> {
        let row = sqlx::query_as::<Postgres, SettingsRow>(
            "SELECT format, quality FROM artifact_settings WHERE kind = $1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch artifact settings")?;

        row.map(|row| {
            Ok(ArtifactSettings {
                format: row.format.parse()?,
                quality: u8::try_from(row.quality.clamp(1, 100))?,
            })
        })
        .transpose()
    }
}
