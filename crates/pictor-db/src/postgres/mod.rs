mod cache_folder;
mod collection;
mod job;
mod queue;
mod settings;

pub use cache_folder::PgCacheFolderRepository;
pub use collection::PgCollectionRepository;
pub use job::PgJobRepository;
pub use queue::PgRequestQueue;
pub use settings::PgSettingsRepository;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use pictor_core::Config;

/// Open the connection pool and apply pending migrations.
pub async fn connect(config: &Config) -> Result<PgPool> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Database connected successfully"
    );

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}

/// Postgres BIGINT columns hold byte counts; saturate instead of wrapping.
pub(crate) fn bytes_to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

pub(crate) fn i64_to_bytes(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
