//! Batch worker behavior against the in-memory run store

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use anyhow::Result;
use async_trait::async_trait;
use autopo_pipeline::{
    CsvSnapshotPipeline, InMemoryRunRepository, JobStatus, Pipeline, PipelineError,
    RunRepository, RunStatus, TransformedRow, Worker,
};
use chrono::NaiveDate;
use common::{init_tracing, pipeline, worker, Fixture, RecordingFlush, PIPELINE};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn jan_5() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
}

#[tokio::test]
async fn test_batch_flushes_on_file_threshold_then_finalize() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 2),
        fixture.stock_file("20240105_store_b.csv", 2),
        fixture.stock_file("20240105_store_c.csv", 2),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let worker = worker(fixture.config(), repository.clone(), callback.clone());

    let run = worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_files, 3);
    assert_eq!(run.processed_files, 3);
    assert_eq!(run.total_rows, 6);
    assert!(run.completed_at.is_some());
    assert_eq!(callback.rows_per_flush(), vec![4, 2]);

    let artifacts = callback.artifacts.lock().unwrap();
    assert!(artifacts[0].0.ends_with("20240105.csv"));
    let header = artifacts[0].1.lines().next().unwrap();
    assert_eq!(header, "sku,qty,snapshot_date,source_file");
}

#[tokio::test]
async fn test_validation_failure_fails_run_without_flushing() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 2),
        fixture.write("20240105_store_b.csv", "sku,quantity\nSKU-1,4\n"),
        fixture.stock_file("20240105_store_c.csv", 2),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let worker = worker(
        fixture.config().with_batch_size(10),
        repository.clone(),
        callback.clone(),
    );

    let err = worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap_err();
    match err {
        PipelineError::FilesFailed { failed, total, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
        },
        other => panic!("unexpected error: {}", other),
    }

    let run = repository.find_run(PIPELINE, jan_5()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.processed_files, 2);
    assert_eq!(run.total_rows, 4);
    assert!(run.error_message.is_some());

    let jobs = repository.file_jobs_for_run(run.id).await.unwrap();
    let completed = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Completed)
        .count();
    assert_eq!(completed, 2);
    let failed = jobs
        .iter()
        .find(|job| job.status == JobStatus::Failed)
        .unwrap();
    assert!(failed.file_path.ends_with("20240105_store_b.csv"));
    assert_eq!(failed.retry_count, 1);

    assert_eq!(callback.calls(), 0);
}

#[tokio::test]
async fn test_rerun_of_completed_batch_is_a_noop() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 3),
        fixture.stock_file("20240105_store_b.csv", 1),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let worker = worker(fixture.config(), repository.clone(), callback.clone());
    let cancel = CancellationToken::new();

    let first = worker.process_batch(&cancel, jan_5(), &files).await.unwrap();
    let second = worker.process_batch(&cancel, jan_5(), &files).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.total_rows, 4);
    assert_eq!(second.processed_files, 2);
    assert_eq!(repository.jobs().await.len(), 2);
    assert_eq!(repository.runs().await.len(), 1);
    assert_eq!(callback.calls(), 1);
}

#[tokio::test]
async fn test_retry_completes_run_after_fix() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 2),
        fixture.write("20240105_store_b.csv", "sku\nSKU-1\n"),
        fixture.stock_file("20240105_store_c.csv", 2),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let worker = worker(
        fixture.config().with_batch_size(10),
        repository.clone(),
        callback.clone(),
    );
    let cancel = CancellationToken::new();

    assert!(worker.process_batch(&cancel, jan_5(), &files).await.is_err());

    fixture.stock_file("20240105_store_b.csv", 2);
    let summary = worker.retry_failed(&cancel).await.unwrap();
    assert_eq!(summary.jobs_retried, 1);
    assert_eq!(summary.runs_retried, 1);
    assert_eq!(summary.runs_completed, 1);
    assert_eq!(summary.runs_failed, 0);

    let run = repository.find_run(PIPELINE, jan_5()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.processed_files, 3);
    assert_eq!(run.total_rows, 6);
    assert!(run.error_message.is_none());

    // The date's snapshot holds every file, replayed ones included.
    assert_eq!(callback.rows_per_flush(), vec![6]);
}

#[tokio::test]
async fn test_retry_count_grows_until_retries_exhausted() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![fixture.write("20240105_broken.csv", "sku\nSKU-1\n")];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let worker = worker(
        fixture.config().with_retry_attempts(2),
        repository.clone(),
        callback.clone(),
    );
    let cancel = CancellationToken::new();

    assert!(worker.process_batch(&cancel, jan_5(), &files).await.is_err());
    assert_eq!(repository.jobs().await[0].retry_count, 1);

    let summary = worker.retry_failed(&cancel).await.unwrap();
    assert_eq!(summary.runs_failed, 1);
    let job = repository.jobs().await.remove(0);
    assert_eq!(job.retry_count, 2);
    assert!(!job.is_retryable(2));

    let summary = worker.retry_failed(&cancel).await.unwrap();
    assert_eq!(summary.jobs_retried, 0);
    assert_eq!(repository.jobs().await[0].retry_count, 2);
}

#[tokio::test]
async fn test_concurrent_acquire_yields_one_run() {
    init_tracing();
    let fixture = Fixture::new();
    let repository = Arc::new(InMemoryRunRepository::new());
    let worker = worker(
        fixture.config(),
        repository.clone(),
        Arc::new(RecordingFlush::default()),
    );

    let (a, b) = tokio::join!(worker.acquire_run(jan_5(), 3), worker.acquire_run(jan_5(), 3));
    assert_eq!(a.unwrap().id, b.unwrap().id);
    assert_eq!(repository.runs().await.len(), 1);
}

#[tokio::test]
async fn test_flush_failure_fails_run_and_keeps_jobs_completed() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![fixture.stock_file("20240105_store_a.csv", 2)];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    callback.set_failing(true);
    let worker = worker(fixture.config(), repository.clone(), callback.clone());

    let err = worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Aggregation(_)));

    let run = repository.find_run(PIPELINE, jan_5()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(repository.jobs().await[0].status, JobStatus::Completed);

    // Loader back up: the completed file is replayed into a fresh snapshot.
    callback.set_failing(false);
    let run = worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_rows, 2);
    assert_eq!(callback.rows_per_flush(), vec![2]);
}

#[tokio::test]
async fn test_threshold_flush_failure_aborts_remaining_files() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 1),
        fixture.stock_file("20240105_store_b.csv", 1),
        fixture.stock_file("20240105_store_c.csv", 1),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    callback.set_failing(true);
    let worker = worker(
        fixture.config().with_worker_count(1),
        repository.clone(),
        callback.clone(),
    );

    let err = worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Aggregation(_)));
    assert!(!err.is_cancelled());

    let run = repository.find_run(PIPELINE, jan_5()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let jobs = repository.jobs().await;
    let count = |status: JobStatus| jobs.iter().filter(|job| job.status == status).count();
    assert_eq!(count(JobStatus::Completed), 1);
    assert_eq!(count(JobStatus::Failed), 1);
    assert_eq!(count(JobStatus::Queued), 1);
    let failed = jobs.iter().find(|job| job.status == JobStatus::Failed).unwrap();
    assert!(failed.file_path.ends_with("20240105_store_b.csv"));
    assert!(failed.error_message.is_some());
}

#[tokio::test]
async fn test_cancelled_batch_is_not_marked_failed() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![fixture.stock_file("20240105_store_a.csv", 2)];
    let repository = Arc::new(InMemoryRunRepository::new());
    let worker = worker(
        fixture.config(),
        repository.clone(),
        Arc::new(RecordingFlush::default()),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = worker.process_batch(&cancel, jan_5(), &files).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(repository.runs().await.is_empty());
}

#[tokio::test]
async fn test_artifact_keeps_identifier_text() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![fixture.write(
        "20240105_store_a.csv",
        "sku,qty\n007,1\n12345678901234567890,2\n1E3,3\n",
    )];
    let callback = Arc::new(RecordingFlush::default());
    let worker = worker(
        fixture.config(),
        Arc::new(InMemoryRunRepository::new()),
        callback.clone(),
    );

    worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap();

    let artifacts = callback.artifacts.lock().unwrap();
    let skus: Vec<&str> = artifacts[0]
        .1
        .lines()
        .skip(1)
        .map(|line| line.split(',').next().unwrap())
        .collect();
    assert_eq!(skus, vec!["007", "12345678901234567890", "1E3"]);
}

/// Interrupts the whole invocation from inside the first transform
struct InterruptingPipeline {
    inner: CsvSnapshotPipeline,
    interrupt: CancellationToken,
}

#[async_trait]
impl Pipeline for InterruptingPipeline {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn validate(&self, path: &Path) -> Result<()> {
        self.inner.validate(path).await
    }

    async fn transform(
        &self,
        cancel: &CancellationToken,
        path: &Path,
    ) -> Result<Vec<TransformedRow>> {
        self.interrupt.cancel();
        self.inner.transform(cancel, path).await
    }

    fn output_table(&self) -> &str {
        self.inner.output_table()
    }

    fn snapshot_date(&self, filename: &str) -> Result<NaiveDate> {
        self.inner.snapshot_date(filename)
    }
}

#[tokio::test]
async fn test_cancellation_during_fan_out_leaves_run_as_is() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 2),
        fixture.stock_file("20240105_store_b.csv", 2),
        fixture.stock_file("20240105_store_c.csv", 2),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let callback = Arc::new(RecordingFlush::default());
    let cancel = CancellationToken::new();
    let interrupting = Arc::new(InterruptingPipeline {
        inner: CsvSnapshotPipeline::new(PIPELINE),
        interrupt: cancel.clone(),
    });
    let worker = Worker::new(
        interrupting,
        repository.clone(),
        callback.clone(),
        fixture.config().with_worker_count(1),
    )
    .unwrap();

    let err = worker.process_batch(&cancel, jan_5(), &files).await.unwrap_err();
    assert!(err.is_cancelled());

    let run = repository.find_run(PIPELINE, jan_5()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Processing);
    assert_eq!(run.processed_files, 0);
    assert!(run.error_message.is_none());

    let jobs = repository.jobs().await;
    let count = |status: JobStatus| jobs.iter().filter(|job| job.status == status).count();
    assert_eq!(count(JobStatus::Processing), 1);
    assert_eq!(count(JobStatus::Queued), 2);
    assert_eq!(count(JobStatus::Failed), 0);
    assert!(jobs.iter().all(|job| job.retry_count == 0));
    assert_eq!(callback.calls(), 0);

    // A fresh invocation picks the run up and completes it.
    let worker = worker_for(&fixture, repository.clone(), callback.clone());
    let run = worker
        .process_batch(&CancellationToken::new(), jan_5(), &files)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_rows, 6);
}

fn worker_for(
    fixture: &Fixture,
    repository: Arc<InMemoryRunRepository>,
    callback: Arc<RecordingFlush>,
) -> Worker {
    Worker::new(pipeline(), repository, callback, fixture.config()).unwrap()
}

#[tokio::test]
async fn test_failed_total_excludes_replayed_files() {
    init_tracing();
    let fixture = Fixture::new();
    let files = vec![
        fixture.stock_file("20240105_store_a.csv", 2),
        fixture.stock_file("20240105_store_b.csv", 2),
        fixture.write("20240105_store_c.csv", "sku\nSKU-1\n"),
    ];
    let repository = Arc::new(InMemoryRunRepository::new());
    let worker = worker(
        fixture.config().with_batch_size(10),
        repository.clone(),
        Arc::new(RecordingFlush::default()),
    );
    let cancel = CancellationToken::new();

    let first = worker.process_batch(&cancel, jan_5(), &files).await.unwrap_err();
    assert!(matches!(first, PipelineError::FilesFailed { failed: 1, total: 3, .. }));

    // Two completed files are replayed; only the broken one is processed again.
    let second = worker.process_batch(&cancel, jan_5(), &files).await.unwrap_err();
    match second {
        PipelineError::FilesFailed { failed, total, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 1);
        },
        other => panic!("unexpected error: {}", other),
    }

    let run = repository.find_run(PIPELINE, jan_5()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.processed_files, 2);
    assert_eq!(run.total_rows, 4);
}
