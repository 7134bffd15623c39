//! Date grouping and per-date batch isolation

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use autopo_pipeline::{
    InMemoryRunRepository, Orchestrator, PipelineError, RunRepository, RunStatus,
};
use chrono::NaiveDate;
use common::{init_tracing, worker, Fixture, RecordingFlush, PIPELINE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

#[tokio::test]
async fn test_groups_files_by_date_in_ascending_order() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240106_store_a.csv", 1),
        fixture.stock_file("20240105_store_a.csv", 1),
        fixture.stock_file("20240106_store_b.csv", 1),
    ];
    let orchestrator = Orchestrator::new(Arc::new(worker(
        fixture.config(),
        Arc::new(InMemoryRunRepository::new()),
        Arc::new(RecordingFlush::default()),
    )));

    let groups = orchestrator.group_by_date(&files).unwrap();
    let dates: Vec<_> = groups.keys().copied().collect();
    assert_eq!(dates, vec![date(5), date(6)]);
    assert_eq!(groups[&date(6)].len(), 2);
}

#[tokio::test]
async fn test_runs_one_batch_per_date() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240106_store_a.csv", 2),
        fixture.stock_file("20240105_store_a.csv", 3),
        fixture.stock_file("20240105_store_b.csv", 1),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let orchestrator = Orchestrator::new(Arc::new(worker(
        fixture.config().with_batch_size(10),
        repository.clone(),
        callback.clone(),
    )));

    let report = orchestrator
        .run(&CancellationToken::new(), &files)
        .await
        .unwrap();

    assert_eq!(report.dates, vec![date(5), date(6)]);
    assert_eq!(report.runs.len(), 2);
    assert_eq!(report.runs[0].snapshot_date, date(5));
    assert_eq!(report.runs[0].total_rows, 4);
    assert_eq!(report.runs[1].total_rows, 2);
    assert_eq!(report.total_rows(), 6);
    assert!(report.runs.iter().all(|run| run.status == RunStatus::Completed));

    let artifacts: Vec<_> = callback
        .artifacts
        .lock()
        .unwrap()
        .iter()
        .map(|(path, _)| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(artifacts, vec!["20240105.csv", "20240106.csv"]);
}

#[tokio::test]
async fn test_failed_date_leaves_earlier_dates_committed() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 2),
        fixture.write("20240106_store_a.csv", "sku\nSKU-1\n"),
        fixture.stock_file("20240107_store_a.csv", 2),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let orchestrator = Orchestrator::new(Arc::new(worker(
        fixture.config(),
        repository.clone(),
        callback.clone(),
    )));

    let err = orchestrator
        .run(&CancellationToken::new(), &files)
        .await
        .unwrap_err();
    match err {
        PipelineError::Batch { date: failed, source } => {
            assert_eq!(failed, date(6));
            assert!(matches!(*source, PipelineError::FilesFailed { .. }));
        },
        other => panic!("unexpected error: {}", other),
    }

    let first = repository.find_run(PIPELINE, date(5)).await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let second = repository.find_run(PIPELINE, date(6)).await.unwrap().unwrap();
    assert_eq!(second.status, RunStatus::Failed);
    assert!(repository.find_run(PIPELINE, date(7)).await.unwrap().is_none());
    assert_eq!(callback.calls(), 1);
}

#[tokio::test]
async fn test_unparsable_file_name_aborts_before_any_run() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 1),
        fixture.stock_file("store_b.csv", 1),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let orchestrator = Orchestrator::new(Arc::new(worker(
        fixture.config(),
        repository.clone(),
        Arc::new(RecordingFlush::default()),
    )));

    let err = orchestrator
        .run(&CancellationToken::new(), &files)
        .await
        .unwrap_err();
    match err {
        PipelineError::SnapshotDate { file, .. } => assert!(file.ends_with("store_b.csv")),
        other => panic!("unexpected error: {}", other),
    }
    assert!(repository.runs().await.is_empty());
}

#[tokio::test]
async fn test_empty_input_is_a_noop() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::new(Arc::new(worker(
        fixture.config(),
        Arc::new(InMemoryRunRepository::new()),
        Arc::new(RecordingFlush::default()),
    )));

    let report = orchestrator.run(&CancellationToken::new(), &[]).await.unwrap();
    assert!(report.dates.is_empty());
    assert!(report.runs.is_empty());
}
