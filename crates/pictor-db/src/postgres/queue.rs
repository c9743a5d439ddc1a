use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};
use std::time::Duration;

use pictor_core::models::{Delivery, DeliveryId, ProcessingRequest};

use crate::ports::RequestQueue;

/// Channel notified after every enqueue so idle workers can wake early.
pub const QUEUE_NOTIFY_CHANNEL: &str = "pictor_new_request";

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: i64,
    payload: Json<ProcessingRequest>,
    attempts: i32,
}

impl From<DeliveryRow> for Delivery {
    fn from(row: DeliveryRow) -> Self {
        Delivery {
            id: DeliveryId(row.id),
            request: row.payload.0,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
        }
    }
}

/// Table-backed queue. A received message stays invisible for the lease
/// duration and comes back on its own if it is neither acked nor nacked.
/// Enqueueing work that is still in the table is a no-op.
#[derive(Clone)]
pub struct PgRequestQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgRequestQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

#[async_trait]
impl RequestQueue for PgRequestQueue {
    #[tracing::instrument(skip(self, requests), fields(count = requests.len()))]
    async fn enqueue(&self, requests: &[ProcessingRequest]) -> Result<usize> {
        if requests.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for enqueue")?;

        let result = sqlx::query(
            r#"
            INSERT INTO processing_queue (kind, payload)
            SELECT r ->> 'kind', r
            FROM jsonb_array_elements($1::jsonb) AS r
            ON CONFLICT (
                kind,
                (payload ->> 'collection_id'),
                (payload ->> 'item_id'),
                (COALESCE(payload ->> 'job_id', ''))
            ) DO NOTHING
            "#,
        )
        .bind(Json(requests))
        .execute(&mut *tx)
        .await
        .context("Failed to enqueue requests")?;

        // Workers poll anyway, so a failed notify is not fatal.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(QUEUE_NOTIFY_CHANNEL)
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(error = %e, "Failed to send pg_notify for new requests");
        }

        tx.commit().await.context("Failed to commit enqueue")?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(requests.len()))
    }

    #[tracing::instrument(skip(self))]
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<Postgres, DeliveryRow>(
            r#"
            UPDATE processing_queue
            SET visible_at = NOW() + make_interval(secs => $2),
                attempts = attempts + 1
            WHERE id IN (
                SELECT id
                FROM processing_queue
                WHERE visible_at <= NOW()
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(self.lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .context("Failed to receive requests")?;

        let mut deliveries: Vec<Delivery> = rows.into_iter().map(Delivery::from).collect();
        deliveries.sort_by_key(|d| d.id);
        Ok(deliveries)
    }

    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    async fn ack(&self, ids: &[DeliveryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        sqlx::query("DELETE FROM processing_queue WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .context("Failed to ack deliveries")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    async fn nack(&self, ids: &[DeliveryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        sqlx::query("UPDATE processing_queue SET visible_at = NOW() WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .context("Failed to nack deliveries")?;

        Ok(())
    }
}
