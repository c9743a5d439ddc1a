mod common;

use chrono::Utc;
use std::collections::HashSet;

use pictor_core::models::{ArtifactKind, ArtifactRecord, JobStatus, OutputFormat};
use pictor_db::{CacheFolderRepository, CollectionRepository};

use common::{folder, Harness};

#[tokio::test]
async fn one_collection_update_per_batch() {
    let harness = Harness::new(120);
    let consumer = harness.consumer();
    let requests = harness.requests();

    for chunk in [&requests[0..50], &requests[50..100], &requests[100..120]] {
        let report = consumer
            .process_batch(harness.window(chunk.to_vec()))
            .await
            .unwrap();
        assert_eq!(report.completed, chunk.len());
        assert_eq!(report.ack.len(), chunk.len());
        assert!(report.nack.is_empty());
    }

    assert_eq!(harness.collections.append_calls(), 3);
    assert_eq!(harness.jobs.increment_calls(), 3);
    let job = harness.job_state().await;
    assert_eq!((job.completed, job.failed), (120, 0));
    assert_eq!(job.status, JobStatus::Completed);

    let collection = harness.collection_state().await;
    assert_eq!(collection.thumbnails.len(), 120);
    assert!(collection.thumbnails.iter().all(|r| r.is_valid()));
    assert!(collection.missing_items(ArtifactKind::Thumbnail).is_empty());
}

#[tokio::test]
async fn redelivery_is_a_no_op() {
    let harness = Harness::new(10);
    let consumer = harness.consumer();

    consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();
    let writes = harness.store.writes();
    let appends = harness.collections.append_calls();
    let generated = harness.generator.calls();
    let records = harness.collection_state().await.thumbnails;

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(report.skipped, 10);
    assert_eq!(report.ack.len(), 10);
    assert_eq!(harness.store.writes(), writes);
    assert_eq!(harness.collections.append_calls(), appends);
    assert_eq!(harness.generator.calls(), generated);
    assert_eq!(harness.collection_state().await.thumbnails, records);
}

#[tokio::test]
async fn oversized_sources_never_reach_the_generator() {
    let mut harness = Harness::new(12);
    harness.config.max_plain_file_bytes = 4_000;
    for index in [1, 5, 9] {
        harness.inflate_source(index, 5_000);
    }
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(report.failed, 3);
    assert_eq!(report.completed, 9);
    assert_eq!(harness.generator.calls(), 9);

    let job = harness.job_state().await;
    assert_eq!((job.completed, job.failed), (9, 3));
    assert_eq!(job.error_counts.get("validation_failure"), Some(&3));
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn collection_visible_on_the_third_lookup() {
    let harness = Harness::new(1);
    harness
        .collections
        .hide_for_lookups(harness.collection.id, 2)
        .unwrap();
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(harness.collections.get_calls(), 3);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);
    let job = harness.job_state().await;
    assert_eq!((job.completed, job.failed), (1, 0));
}

#[tokio::test]
async fn collection_never_visible_is_a_tracked_failure() {
    let harness = Harness::new(2);
    harness
        .collections
        .hide_for_lookups(harness.collection.id, 10)
        .unwrap();
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(harness.collections.get_calls(), 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.ack.len(), 2);
    assert_eq!(harness.generator.calls(), 0);
    let job = harness.job_state().await;
    assert_eq!(job.failed, 2);
    assert_eq!(job.error_counts.get("transient_visibility_failure"), Some(&2));
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn settings_outage_aborts_the_whole_batch() {
    let harness = Harness::new(5);
    harness.settings.fail_lookups(true);
    let consumer = harness.consumer();

    let result = consumer
        .process_batch(harness.window(harness.requests()))
        .await;

    assert!(result.is_err());
    assert_eq!(harness.generator.calls(), 0);
    assert_eq!(harness.store.writes(), 0);
    let job = harness.job_state().await;
    assert_eq!((job.completed, job.failed), (0, 0));
}

#[tokio::test]
async fn full_folder_is_skipped_and_usage_is_batched() {
    let dir = tempfile::tempdir().unwrap();
    let full = folder(dir.path().join("a"), 1, Some(10), 10);
    let spare = folder(dir.path().join("b"), 2, None, 0);
    let harness = Harness::with_folders(dir, 6, vec![full.clone(), spare.clone()]);
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();
    assert_eq!(report.completed, 6);

    let collection = harness.collection_state().await;
    let used: HashSet<_> = collection.thumbnails.iter().map(|r| r.folder_id).collect();
    assert_eq!(used, HashSet::from([spare.id]));

    let written: u64 = collection.thumbnails.iter().map(|r| r.size_bytes).sum();
    assert_eq!(harness.folders.increment_calls(), 1);
    let spare_now = harness.folders.folder(spare.id).unwrap().unwrap();
    assert_eq!(spare_now.current_size_bytes, written);
    let active = harness.folders.list_active().await.unwrap();
    assert_eq!(active[0].current_size_bytes, 10);
}

#[tokio::test]
async fn every_folder_full_still_writes_to_the_preferred_one() {
    let dir = tempfile::tempdir().unwrap();
    let a = folder(dir.path().join("a"), 1, Some(10), 10);
    let b = folder(dir.path().join("b"), 2, Some(10), 10);
    let harness = Harness::with_folders(dir, 2, vec![b, a.clone()]);
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(report.completed, 2);
    let collection = harness.collection_state().await;
    assert!(collection.thumbnails.iter().all(|r| r.folder_id == a.id));
}

#[tokio::test]
async fn unpersisted_artifacts_are_adopted_on_redelivery() {
    let harness = Harness::new(4);
    let consumer = harness.consumer();

    harness.collections.fail_appends(true);
    let first = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();
    assert_eq!(first.nack.len(), 4);
    assert!(first.ack.is_empty());
    assert_eq!(harness.store.writes(), 4);
    assert_eq!(harness.job_state().await.completed, 0);

    harness.collections.fail_appends(false);
    let second = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(second.completed, 4);
    assert_eq!(harness.store.writes(), 4);
    assert_eq!(harness.generator.calls(), 4);
    let collection = harness.collection_state().await;
    assert_eq!(collection.thumbnails.len(), 4);
    assert!(collection.thumbnails.iter().all(|r| r.is_valid()));
    assert_eq!(harness.job_state().await.status, JobStatus::Completed);
}

#[tokio::test]
async fn duplicate_deliveries_in_one_batch_are_acked_once_counted() {
    let harness = Harness::new(3);
    let consumer = harness.consumer();
    let mut requests = harness.requests();
    requests.push(requests[0].clone());

    let report = consumer.process_batch(harness.window(requests)).await.unwrap();

    assert_eq!(report.ack.len(), 4);
    assert_eq!(report.completed, 3);
    assert_eq!(harness.generator.calls(), 3);
    assert_eq!(harness.job_state().await.completed, 3);
}

#[tokio::test]
async fn undecodable_source_fails_only_its_item() {
    let harness = Harness::new(3);
    std::fs::write(&harness.collection.items[1].source, b"definitely not a png").unwrap();
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    let job = harness.job_state().await;
    assert_eq!(job.error_counts.get("generation_failure"), Some(&1));
    assert!(job.last_error.is_some());
    assert!(job.failure_reason.is_none());
}

#[tokio::test]
async fn redelivered_items_are_counted_once() {
    let harness = Harness::new(4);
    let consumer = harness.consumer();
    let requests = harness.requests();

    for request in [&requests[0], &requests[0], &requests[1], &requests[1]] {
        let report = consumer
            .process_batch(harness.window(vec![request.clone()]))
            .await
            .unwrap();
        assert_eq!(report.ack.len(), 1);
    }

    assert_eq!(harness.generator.calls(), 2);
    let job = harness.job_state().await;
    assert_eq!((job.completed, job.failed), (2, 0));
    assert_eq!(job.status, JobStatus::Running);
    let collection = harness.collection_state().await;
    assert_eq!(collection.missing_items(ArtifactKind::Thumbnail).len(), 2);
}

#[tokio::test]
async fn artifacts_from_before_the_job_count_as_done() {
    let harness = Harness::new(3);
    let existing = ArtifactRecord {
        source_item_id: harness.collection.items[0].id,
        folder_id: uuid::Uuid::new_v4(),
        path: "thumbnails/earlier.jpg".into(),
        width: 16,
        height: 11,
        size_bytes: 512,
        format: OutputFormat::Jpeg,
        quality: 80,
        generated_at: Utc::now() - chrono::Duration::hours(1),
    };
    harness
        .collections
        .append_artifacts(harness.collection.id, ArtifactKind::Thumbnail, &[existing])
        .await
        .unwrap();
    let consumer = harness.consumer();

    let report = consumer
        .process_batch(harness.window(harness.requests()))
        .await
        .unwrap();

    assert_eq!((report.skipped, report.completed), (1, 2));
    assert_eq!(harness.generator.calls(), 2);
    let job = harness.job_state().await;
    assert_eq!(job.completed, 3);
    assert_eq!(job.status, JobStatus::Completed);
}
