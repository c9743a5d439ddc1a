mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use pictor_core::models::JobStatus;
use pictor_db::memory::MemoryRequestQueue;
use pictor_db::RequestQueue;
use pictor_worker::{
    AccumulatorConfig, FixedBatchSize, HealthMonitor, RuntimeConfig, WorkerRuntime,
};

use common::Harness;

fn runtime_for(harness: &Harness, queue: Arc<MemoryRequestQueue>) -> WorkerRuntime {
    let accumulator = AccumulatorConfig {
        thumbnail_batch_size: 50,
        cache_batch_size: 25,
        flush_interval: Duration::from_millis(100),
        ..AccumulatorConfig::default()
    };
    let config = RuntimeConfig {
        poll_interval: Duration::from_millis(10),
        receive_batch: 200,
        recovery_enabled: false,
        ..RuntimeConfig::default()
    };
    WorkerRuntime::new(
        queue,
        Arc::new(harness.consumer()),
        Arc::new(HealthMonitor::new()),
        Arc::new(FixedBatchSize::from_config(&accumulator)),
        config,
        accumulator,
    )
}

async fn wait_until_drained(queue: &MemoryRequestQueue) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue was not drained");
}

#[tokio::test]
async fn hundred_twenty_requests_flush_as_three_batches() {
    let harness = Harness::new(120);
    let queue = Arc::new(MemoryRequestQueue::default());
    queue.enqueue(&harness.requests()).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(runtime_for(&harness, queue.clone()).run(shutdown.clone()));

    wait_until_drained(&queue).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(harness.collections.append_calls(), 3);
    let job = harness.job_state().await;
    assert_eq!((job.completed, job.failed), (120, 0));
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.generator.calls(), 120);
}

#[tokio::test]
async fn aborted_batches_are_redelivered() {
    let harness = Harness::new(5);
    harness.settings.fail_lookups(true);
    let queue = Arc::new(MemoryRequestQueue::default());
    queue.enqueue(&harness.requests()).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(runtime_for(&harness, queue.clone()).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.len(), 5);
    assert_eq!(harness.generator.calls(), 0);

    harness.settings.fail_lookups(false);
    wait_until_drained(&queue).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    let job = harness.job_state().await;
    assert_eq!(job.completed, 5);
    assert_eq!(job.status, JobStatus::Completed);
}
