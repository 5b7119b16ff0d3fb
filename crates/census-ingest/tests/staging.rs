//! Staging pipeline tests over the in-memory connection source.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing,
    clippy::panic
)]

use std::time::Duration;

use census_db::{ConnectionSource, MemorySource, QueryParam, RowSet};
use census_ingest::{IngestConfig, IngestError, IngestService};
use census_scheduler::QueueError;

const INSERT_SQL: &str = "INSERT INTO temporarymeasurements (file_id, row_no, value) VALUES ($1, $2, $3)";

fn test_config() -> IngestConfig {
    IngestConfig::parse(
        "
queue:
  concurrency: 4
locks:
  max_wait_secs: 1
retry:
  max_retries: 3
  base_delay_ms: 10
  max_jitter_ms: 0
",
    )
    .unwrap()
}

fn service() -> (MemorySource, IngestService<MemorySource>) {
    let source = MemorySource::new();
    source.respond_with("INSERT", RowSet::affected(1));
    let service = IngestService::from_source(source.clone(), &test_config());
    (source, service)
}

fn rows(file_id: &str, count: i64) -> Vec<Vec<QueryParam>> {
    (0..count)
        .map(|n| {
            vec![
                QueryParam::from(file_id),
                QueryParam::from(n),
                QueryParam::from("12.5"),
            ]
        })
        .collect()
}

fn count(source: &MemorySource, sql: &str) -> usize {
    source
        .statement_texts()
        .iter()
        .filter(|s| s.starts_with(sql))
        .count()
}

#[tokio::test]
async fn stages_every_chunk_in_its_own_transaction() {
    let (source, service) = service();

    let report = service
        .stage_file("upload-1", INSERT_SQL, rows("upload-1", 10), 4)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.rows, 10);
    assert_eq!(report.inserted, 10);
    let sizes: Vec<usize> = report.chunks.iter().map(|c| c.rows).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    assert_eq!(count(&source, "BEGIN"), 3);
    assert_eq!(count(&source, "COMMIT"), 3);
    assert_eq!(count(&source, "INSERT"), 10);
    assert_eq!(source.outstanding(), 0);
    assert_eq!(service.manager().transaction_count(), 0);
    assert!(service.queue().locks().is_empty());
}

#[tokio::test]
async fn failed_chunk_is_reported_and_others_commit() {
    let (source, service) = service();
    source.fail_matching(
        "INSERT",
        Some("23505"),
        "duplicate key value violates unique constraint",
        Some(1),
    );

    let report = service
        .stage_file("upload-2", INSERT_SQL, rows("upload-2", 9), 3)
        .await
        .unwrap();

    assert_eq!(report.failed_chunks(), 1);
    assert_eq!(report.inserted, 6);
    let failed = report.chunks.iter().find(|c| c.error.is_some()).unwrap();
    assert_eq!(failed.inserted, 0);
    assert!(failed.error.as_deref().unwrap().contains("duplicate key"));

    // Constraint errors are not retried: three transactions, one rolled back.
    assert_eq!(count(&source, "BEGIN"), 3);
    assert_eq!(count(&source, "COMMIT"), 2);
    assert_eq!(count(&source, "ROLLBACK"), 1);
    assert_eq!(source.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadlocked_chunk_is_retried_to_completion() {
    let (source, service) = service();
    source.fail_matching("INSERT", Some("40P01"), "deadlock detected", Some(1));

    let report = service
        .stage_file("upload-3", INSERT_SQL, rows("upload-3", 4), 2)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.inserted, 4);
    // One extra transaction for the retried chunk.
    assert_eq!(count(&source, "BEGIN"), 3);
    assert_eq!(count(&source, "ROLLBACK"), 1);
    assert_eq!(count(&source, "COMMIT"), 2);
}

#[tokio::test]
async fn empty_file_runs_nothing() {
    let (source, service) = service();
    let report = service
        .stage_file("upload-4", INSERT_SQL, Vec::new(), 100)
        .await
        .unwrap();

    assert!(report.chunks.is_empty());
    assert!(report.is_complete());
    assert!(source.statements().is_empty());
}

#[tokio::test]
async fn zero_chunk_size_means_one_row_per_chunk() {
    let (_source, service) = service();
    let report = service
        .stage_file("upload-5", INSERT_SQL, rows("upload-5", 3), 0)
        .await
        .unwrap();
    assert_eq!(report.chunks.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn held_file_lock_fails_the_batch() {
    let (source, service) = service();
    let held = service
        .queue()
        .locks()
        .acquire("file:upload-6", "another-worker")
        .await
        .unwrap();

    let err = service
        .stage_file("upload-6", INSERT_SQL, rows("upload-6", 2), 1)
        .await
        .unwrap_err();

    match err {
        IngestError::Scheduling {
            source: QueueError::LockAcquisitionTimeout { resource, waited },
        } => {
            assert_eq!(resource, "file:upload-6");
            assert!(waited >= Duration::from_secs(1));
        }
        other => panic!("expected lock timeout, got {other:?}"),
    }
    assert!(source.statements().is_empty());

    assert!(service.queue().locks().release(held));
    assert!(service.queue().locks().is_empty());
}

#[tokio::test]
async fn health_check_reports_unreachable_database() {
    let (source, service) = service();
    service.health_check().await.unwrap();
    assert_eq!(source.statement_texts(), vec!["SELECT 1"]);

    source.set_fail_acquire(true);
    let err = service.health_check().await.unwrap_err();
    assert!(matches!(err, IngestError::Database { .. }));
}

#[tokio::test]
async fn stats_reflect_configuration() {
    let (_source, service) = service();
    let stats = service.stats();
    assert_eq!(stats.concurrency, 4);
    assert_eq!(stats.size, 0);
    assert_eq!(stats.active_locks, 0);
}

#[tokio::test]
async fn shutdown_closes_the_source() {
    let (source, service) = service();
    service.shutdown().await;
    assert!(source.is_closed());
    assert!(source.acquire().await.is_err());
}
