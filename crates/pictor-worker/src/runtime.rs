//! Worker runtime: queue polling, per-kind accumulation, bounded batch
//! dispatch and the recovery loop, all stopped by one cancellation token.
//!
//! Shutdown: once the token is cancelled the poll loop stops, accumulators
//! flush what they can, leftovers are nacked and in-flight batches are awaited
//! before [`WorkerRuntime::run`] returns.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pictor_core::models::{ArtifactKind, DeliveryId};
use pictor_db::RequestQueue;

use crate::accumulator::{BatchAccumulator, BatchWindow};
use crate::config::{AccumulatorConfig, RuntimeConfig};
use crate::consumer::BatchConsumer;
use crate::health::HealthMonitor;
use crate::policy::BatchSizePolicy;
use crate::recovery::StaleJobRecovery;

pub struct WorkerRuntime {
    queue: Arc<dyn RequestQueue>,
    consumer: Arc<BatchConsumer>,
    recovery: Option<Arc<StaleJobRecovery>>,
    health: Arc<HealthMonitor>,
    policy: Arc<dyn BatchSizePolicy>,
    config: RuntimeConfig,
    accumulator: AccumulatorConfig,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        consumer: Arc<BatchConsumer>,
        health: Arc<HealthMonitor>,
        policy: Arc<dyn BatchSizePolicy>,
        config: RuntimeConfig,
        accumulator: AccumulatorConfig,
    ) -> Self {
        Self {
            queue,
            consumer,
            recovery: None,
            health,
            policy,
            config,
            accumulator,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<StaleJobRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            receive_batch = self.config.receive_batch,
            max_concurrent_batches = self.config.max_concurrent_batches,
            thumbnail_batch_size = self.accumulator.thumbnail_batch_size,
            cache_batch_size = self.accumulator.cache_batch_size,
            recovery = self.recovery.is_some() && self.config.recovery_enabled,
            "Worker runtime started"
        );

        let (windows_tx, windows_rx) = mpsc::channel(self.accumulator.max_pending_windows.max(1));
        let accumulators: HashMap<ArtifactKind, Arc<BatchAccumulator>> = ArtifactKind::ALL
            .into_iter()
            .map(|kind| {
                let accumulator = BatchAccumulator::new(
                    kind,
                    self.accumulator.queue_capacity,
                    self.policy.clone(),
                    self.health.clone(),
                    windows_tx.clone(),
                );
                (kind, Arc::new(accumulator))
            })
            .collect();
        drop(windows_tx);

        let timer_stop = CancellationToken::new();
        let timers: Vec<_> = accumulators
            .values()
            .map(|acc| {
                tokio::spawn(
                    acc.clone()
                        .run_flush_timer(self.accumulator.flush_interval, timer_stop.clone()),
                )
            })
            .collect();

        let dispatcher = tokio::spawn(dispatch(
            windows_rx,
            self.consumer.clone(),
            self.queue.clone(),
            self.health.clone(),
            self.config.max_concurrent_batches,
        ));

        let recovery = match (&self.recovery, self.config.recovery_enabled) {
            (Some(recovery), true) => Some(tokio::spawn(recovery.clone().run(shutdown.clone()))),
            _ => None,
        };

        self.poll(&accumulators, &shutdown).await;

        tracing::info!("Worker runtime shutting down");
        timer_stop.cancel();
        for timer in timers {
            if let Err(e) = timer.await {
                tracing::error!(error = %e, "Flush timer panicked");
            }
        }
        let mut leftovers: Vec<DeliveryId> = Vec::new();
        for accumulator in accumulators.values() {
            leftovers.extend(accumulator.drain()?.into_iter().map(|d| d.id));
        }
        if !leftovers.is_empty() {
            if let Err(e) = self.queue.nack(&leftovers).await {
                tracing::warn!(error = %e, count = leftovers.len(), "Failed to release queued deliveries");
            }
        }
        drop(accumulators);

        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Batch dispatcher panicked");
        }
        if let Some(recovery) = recovery {
            if let Err(e) = recovery.await {
                tracing::error!(error = %e, "Recovery loop panicked");
            }
        }

        tracing::info!("Worker runtime stopped");
        Ok(())
    }

    async fn poll(
        &self,
        accumulators: &HashMap<ArtifactKind, Arc<BatchAccumulator>>,
        shutdown: &CancellationToken,
    ) {
        let receive_batch = self.config.receive_batch.max(1);
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let mut idle = true;
            match self.queue.receive(receive_batch).await {
                Ok(deliveries) => {
                    let full = deliveries.len() >= receive_batch;
                    let mut rejected = Vec::new();
                    for delivery in deliveries {
                        let id = delivery.id;
                        let accepted = match accumulators.get(&delivery.request.kind) {
                            Some(accumulator) => accumulator.add(delivery).unwrap_or_else(|e| {
                                tracing::error!(error = %e, "Failed to queue delivery");
                                false
                            }),
                            None => false,
                        };
                        if !accepted {
                            rejected.push(id);
                        }
                    }
                    if !rejected.is_empty() {
                        tracing::debug!(count = rejected.len(), "Backpressure, releasing deliveries");
                        if let Err(e) = self.queue.nack(&rejected).await {
                            tracing::warn!(error = %e, "Failed to release rejected deliveries");
                        }
                    }
                    idle = !full || !rejected.is_empty();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from queue");
                }
            }

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }
}

/// Hand flushed windows to consumers, at most `max_concurrent` at a time.
async fn dispatch(
    mut windows: mpsc::Receiver<BatchWindow>,
    consumer: Arc<BatchConsumer>,
    queue: Arc<dyn RequestQueue>,
    health: Arc<HealthMonitor>,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let Some(window) = windows.recv().await else {
            break;
        };
        health.window_dequeued();

        let consumer = consumer.clone();
        let queue = queue.clone();
        let health = health.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            handle_window(&consumer, queue.as_ref(), &health, window).await;
        });

        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "Batch task panicked");
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Batch task panicked");
        }
    }
}

async fn handle_window(
    consumer: &BatchConsumer,
    queue: &dyn RequestQueue,
    health: &HealthMonitor,
    window: BatchWindow,
) {
    let kind = window.kind;
    let ids: Vec<DeliveryId> = window.deliveries.iter().map(|d| d.id).collect();

    match consumer.process_batch(window).await {
        Ok(report) => {
            if !report.ack.is_empty() {
                if let Err(e) = queue.ack(&report.ack).await {
                    tracing::error!(error = %e, count = report.ack.len(), "Failed to ack deliveries");
                }
            }
            if !report.nack.is_empty() {
                if let Err(e) = queue.nack(&report.nack).await {
                    tracing::warn!(error = %e, count = report.nack.len(), "Failed to nack deliveries");
                }
            }
            health.record_batch(report.succeeded(), report.failed);
        }
        Err(e) => {
            tracing::error!(
                kind = %kind,
                size = ids.len(),
                error = %e,
                "Batch aborted, leaving deliveries for redelivery"
            );
            if let Err(e) = queue.nack(&ids).await {
                tracing::warn!(error = %e, "Failed to nack aborted batch");
            }
            health.record_batch(0, ids.len());
        }
    }
}
