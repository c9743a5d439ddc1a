//! Per-kind batch accumulation.
//!
//! Producers call [`BatchAccumulator::add`]; full queues and the flush timer
//! drain into a [`BatchWindow`] that is handed to the consumers over a bounded
//! channel. `add` never waits on a consumer.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pictor_core::models::{ArtifactKind, Delivery};

use crate::health::HealthMonitor;
use crate::policy::BatchSizePolicy;

/// Requests drained from one accumulator queue in a single flush.
#[derive(Debug)]
pub struct BatchWindow {
    pub kind: ArtifactKind,
    pub deliveries: Vec<Delivery>,
    pub opened_at: Instant,
}

impl BatchWindow {
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

struct Pending {
    deliveries: Vec<Delivery>,
    opened_at: Instant,
}

pub struct BatchAccumulator {
    kind: ArtifactKind,
    capacity: usize,
    pending: Mutex<Pending>,
    policy: Arc<dyn BatchSizePolicy>,
    health: Arc<HealthMonitor>,
    windows: mpsc::Sender<BatchWindow>,
}

impl BatchAccumulator {
    pub fn new(
        kind: ArtifactKind,
        capacity: usize,
        policy: Arc<dyn BatchSizePolicy>,
        health: Arc<HealthMonitor>,
        windows: mpsc::Sender<BatchWindow>,
    ) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            pending: Mutex::new(Pending {
                deliveries: Vec::new(),
                opened_at: Instant::now(),
            }),
            policy,
            health,
            windows,
        }
    }

    fn pending(&self) -> Result<MutexGuard<'_, Pending>> {
        self.pending
            .lock()
            .map_err(|_| anyhow!("Accumulator lock poisoned"))
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.pending().map(|p| p.deliveries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue one delivery. Returns `false` when the queue is at its cap; the
    /// caller must leave the message unacknowledged.
    pub fn add(&self, delivery: Delivery) -> Result<bool> {
        let threshold = self.policy.batch_size(self.kind, &self.health.signal());
        let queued = {
            let mut pending = self.pending()?;
            if pending.deliveries.len() >= self.capacity {
                tracing::debug!(
                    kind = %self.kind,
                    capacity = self.capacity,
                    delivery_id = %delivery.id,
                    "Accumulator full, rejecting delivery"
                );
                return Ok(false);
            }
            if pending.deliveries.is_empty() {
                pending.opened_at = Instant::now();
            }
            pending.deliveries.push(delivery);
            pending.deliveries.len()
        };

        if queued >= threshold {
            self.flush()?;
        }
        Ok(true)
    }

    /// Drain the whole queue into one window. When every consumer slot is
    /// taken the queue is kept intact and the next trigger retries. Returns
    /// the number of deliveries flushed.
    pub fn flush(&self) -> Result<usize> {
        let permit = match self.windows.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::debug!(kind = %self.kind, "Consumers busy, deferring flush");
                return Ok(0);
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(anyhow!("Batch consumer channel closed"));
            }
        };

        let window = {
            let mut pending = self.pending()?;
            if pending.deliveries.is_empty() {
                return Ok(0);
            }
            BatchWindow {
                kind: self.kind,
                deliveries: std::mem::take(&mut pending.deliveries),
                opened_at: std::mem::replace(&mut pending.opened_at, Instant::now()),
            }
        };

        let flushed = window.len();
        tracing::debug!(kind = %self.kind, size = flushed, "Flushing batch window");
        self.health.window_queued();
        permit.send(window);
        Ok(flushed)
    }

    /// Take whatever is still queued without flushing it, e.g. to nack it on
    /// shutdown.
    pub fn drain(&self) -> Result<Vec<Delivery>> {
        Ok(std::mem::take(&mut self.pending()?.deliveries))
    }

    /// Flush on a fixed interval until cancelled, then flush once more.
    pub async fn run_flush_timer(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.flush() {
                        tracing::error!(kind = %self.kind, error = %e, "Timed flush failed");
                    }
                }
            }
        }

        if let Err(e) = self.flush() {
            tracing::warn!(kind = %self.kind, error = %e, "Final flush failed");
        }
    }
}
