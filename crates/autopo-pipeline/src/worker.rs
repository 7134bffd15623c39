//! Batch worker
//!
//! Drives one (pipeline, date) run end to end: acquires the run, registers a
//! job per input file, fans the files out to a bounded pool, feeds successful
//! transforms to the aggregator and finalizes only when every file succeeded.
//!
//! Files of a re-opened run that already completed are replayed into the new
//! aggregator without touching their job records or the run counters. Their
//! rows were buffered by the failed attempt but never flushed, and the date's
//! snapshot has to contain every file once the run completes.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{FlushCallback, StreamingAggregator};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, TransformedRow};
use crate::repository::{FileJob, JobStatus, NewPipelineRun, PipelineRun, RunRepository};

/// Outcome of one retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub jobs_retried: usize,
    pub runs_retried: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
}

/// One unit of work for the pool
enum WorkItem {
    /// A job that still needs processing
    Job(FileJob),
    /// A completed job whose rows must be buffered again
    Replay(FileJob),
}

enum FileOutcome {
    Completed,
    Replayed,
    Failed(String),
    Skipped,
    Fatal(PipelineError),
}

#[derive(Debug, Default)]
struct FanOutReport {
    completed: usize,
    replayed: usize,
    failed: usize,
    skipped: usize,
    first_error: Option<String>,
}

pub struct Worker {
    pipeline: Arc<dyn Pipeline>,
    repository: Arc<dyn RunRepository>,
    callback: Arc<dyn FlushCallback>,
    config: PipelineConfig,
}

impl Worker {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        repository: Arc<dyn RunRepository>,
        callback: Arc<dyn FlushCallback>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pipeline,
            repository,
            callback,
            config,
        })
    }

    pub fn pipeline(&self) -> &dyn Pipeline {
        self.pipeline.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every file of one business date
    ///
    /// Returns the refreshed run record on success. Any failed file fails the
    /// run with [`PipelineError::FilesFailed`] and leaves the buffered rows
    /// unflushed.
    pub async fn process_batch(
        &self,
        cancel: &CancellationToken,
        snapshot_date: NaiveDate,
        files: &[PathBuf],
    ) -> Result<PipelineRun> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let started = Instant::now();
        let name = self.pipeline.name().to_string();
        info!(
            pipeline = %name,
            date = %snapshot_date,
            files = files.len(),
            "Processing batch"
        );

        let mut run = self.acquire_run(snapshot_date, files.len()).await?;
        let existing: HashMap<String, FileJob> = self
            .repository
            .file_jobs_for_run(run.id)
            .await?
            .into_iter()
            .map(|job| (job.file_path.clone(), job))
            .collect();

        let all_done = files.iter().all(|file| {
            existing
                .get(&path_key(file))
                .is_some_and(|job| job.status == JobStatus::Completed)
        });
        if run.is_complete() && all_done {
            info!(
                pipeline = %name,
                date = %snapshot_date,
                run_id = %run.id,
                "Run already completed, nothing to do"
            );
            return Ok(run);
        }

        let work = self.register_jobs(&run, &existing, files).await?;

        run.mark_processing();
        self.repository.update_run(&run).await?;

        let aggregator =
            StreamingAggregator::new(&self.config, snapshot_date, self.callback.clone());
        let run = self.settle(cancel, run, &aggregator, work).await?;

        info!(
            pipeline = %name,
            date = %snapshot_date,
            run_id = %run.id,
            files = run.processed_files,
            rows = run.total_rows,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Completed batch"
        );
        Ok(run)
    }

    /// Look up the run for `snapshot_date`, creating it when absent
    ///
    /// An existing run has its total file count reconciled with the batch.
    pub async fn acquire_run(
        &self,
        snapshot_date: NaiveDate,
        total_files: usize,
    ) -> Result<PipelineRun> {
        let total_files = i32::try_from(total_files)
            .map_err(|_| PipelineError::Config(format!("too many files: {}", total_files)))?;
        let name = self.pipeline.name();

        if let Some(mut run) = self.repository.find_run(name, snapshot_date).await? {
            debug!(pipeline = %name, date = %snapshot_date, run_id = %run.id, "Reusing run");
            if run.total_files != total_files {
                run.total_files = total_files;
                self.repository.update_run(&run).await?;
            }
            return Ok(run);
        }

        let run = self
            .repository
            .create_run(NewPipelineRun {
                pipeline_name: name.to_string(),
                snapshot_date,
                total_files,
            })
            .await?;
        info!(pipeline = %name, date = %snapshot_date, run_id = %run.id, "Created run");
        Ok(run)
    }

    /// Reprocess failed jobs that are still below the retry ceiling
    ///
    /// Runs are retried independently; a run that fails again is logged and
    /// counted, and the pass moves on.
    pub async fn retry_failed(&self, cancel: &CancellationToken) -> Result<RetrySummary> {
        let name = self.pipeline.name();
        let jobs = self
            .repository
            .failed_file_jobs(name, self.config.retry_attempts)
            .await?;

        let mut summary = RetrySummary::default();
        if jobs.is_empty() {
            info!(pipeline = %name, "No failed jobs to retry");
            return Ok(summary);
        }

        info!(
            pipeline = %name,
            jobs = jobs.len(),
            backoff_secs = self.config.retry_backoff.as_secs_f64(),
            "Retrying failed jobs"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(self.config.retry_backoff) => {},
        }

        let mut by_run: BTreeMap<Uuid, Vec<FileJob>> = BTreeMap::new();
        for job in jobs {
            by_run.entry(job.run_id).or_default().push(job);
        }

        for (run_id, jobs) in by_run {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            summary.runs_retried += 1;
            summary.jobs_retried += jobs.len();
            match self.retry_run(cancel, run_id, jobs).await {
                Ok(run) if run.is_complete() => summary.runs_completed += 1,
                Ok(run) => {
                    debug!(run_id = %run.id, status = %run.status, "Run not complete after retry");
                },
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Retry of run failed");
                    summary.runs_failed += 1;
                },
            }
        }

        info!(
            pipeline = %name,
            runs_retried = summary.runs_retried,
            runs_completed = summary.runs_completed,
            runs_failed = summary.runs_failed,
            "Retry pass done"
        );
        Ok(summary)
    }

    async fn retry_run(
        &self,
        cancel: &CancellationToken,
        run_id: Uuid,
        jobs: Vec<FileJob>,
    ) -> Result<PipelineRun> {
        let mut run = self.repository.get_run(run_id).await?;
        info!(
            pipeline = %run.pipeline_name,
            date = %run.snapshot_date,
            run_id = %run.id,
            jobs = jobs.len(),
            "Retrying run"
        );

        let retry_ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
        let mut work: Vec<WorkItem> = jobs.into_iter().map(WorkItem::Job).collect();
        if !run.is_complete() {
            work.extend(
                self.repository
                    .file_jobs_for_run(run.id)
                    .await?
                    .into_iter()
                    .filter(|job| job.status == JobStatus::Completed && !retry_ids.contains(&job.id))
                    .map(WorkItem::Replay),
            );
        }

        run.mark_processing();
        self.repository.update_run(&run).await?;

        let aggregator =
            StreamingAggregator::new(&self.config, run.snapshot_date, self.callback.clone());
        self.settle(cancel, run, &aggregator, work).await
    }

    /// Create or re-queue the job for every file
    async fn register_jobs(
        &self,
        run: &PipelineRun,
        existing: &HashMap<String, FileJob>,
        files: &[PathBuf],
    ) -> Result<Vec<WorkItem>> {
        let mut work = Vec::with_capacity(files.len());
        for file in files {
            let key = path_key(file);
            match existing.get(&key) {
                Some(job) if job.status == JobStatus::Completed => {
                    if !run.is_complete() {
                        work.push(WorkItem::Replay(job.clone()));
                    }
                },
                Some(job) => {
                    let mut job = job.clone();
                    job.mark_queued();
                    self.repository.update_file_job(&job).await?;
                    work.push(WorkItem::Job(job));
                },
                None => {
                    let job = self.repository.create_file_job(run.id, &key, None).await?;
                    work.push(WorkItem::Job(job));
                },
            }
        }
        Ok(work)
    }

    /// Fan out, wait for every file, then fail or finalize the run
    async fn settle(
        &self,
        cancel: &CancellationToken,
        mut run: PipelineRun,
        aggregator: &StreamingAggregator,
        work: Vec<WorkItem>,
    ) -> Result<PipelineRun> {
        let report = match self.fan_out(cancel, run.id, aggregator, work).await {
            Ok(report) => report,
            Err(PipelineError::Cancelled) => {
                warn!(
                    pipeline = %run.pipeline_name,
                    date = %run.snapshot_date,
                    run_id = %run.id,
                    "Batch cancelled, leaving run as is"
                );
                return Err(PipelineError::Cancelled);
            },
            Err(e) => return Err(self.fail_run(&mut run, e).await),
        };

        if report.replayed > 0 {
            debug!(run_id = %run.id, replayed = report.replayed, "Replayed completed files");
        }
        if report.failed > 0 {
            // Replays are files this attempt did not process.
            let err = PipelineError::FilesFailed {
                failed: report.failed,
                total: report.completed + report.failed + report.skipped,
                first_error: report.first_error.unwrap_or_default(),
            };
            return Err(self.fail_run(&mut run, err).await);
        }

        let refreshed = self.repository.get_run(run.id).await?;
        if refreshed.processed_files < refreshed.total_files {
            let err = PipelineError::Repository(format!(
                "only {} of {} files processed",
                refreshed.processed_files, refreshed.total_files
            ));
            return Err(self.fail_run(&mut run, err).await);
        }

        if let Err(e) = aggregator.finalize(cancel).await {
            if e.is_cancelled() {
                return Err(e);
            }
            return Err(self.fail_run(&mut run, e).await);
        }

        run.mark_completed();
        self.repository.update_run(&run).await?;
        self.repository.get_run(run.id).await
    }

    async fn fan_out(
        &self,
        cancel: &CancellationToken,
        run_id: Uuid,
        aggregator: &StreamingAggregator,
        work: Vec<WorkItem>,
    ) -> Result<FanOutReport> {
        let batch_cancel = cancel.child_token();
        let batch_cancel = &batch_cancel;
        let workers = self.config.effective_worker_count();

        let outcomes: Vec<FileOutcome> = stream::iter(work)
            .map(|item| async move {
                match item {
                    WorkItem::Job(job) => {
                        self.process_job(batch_cancel, run_id, aggregator, job).await
                    },
                    WorkItem::Replay(job) => self.replay_job(batch_cancel, aggregator, job).await,
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = FanOutReport::default();
        let mut fatal: Option<PipelineError> = None;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Completed => report.completed += 1,
                FileOutcome::Replayed => report.replayed += 1,
                FileOutcome::Failed(message) => {
                    report.failed += 1;
                    report.first_error.get_or_insert(message);
                },
                FileOutcome::Skipped => report.skipped += 1,
                FileOutcome::Fatal(e) => {
                    if fatal.as_ref().map_or(true, PipelineError::is_cancelled) {
                        fatal = Some(e);
                    }
                },
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(report)
    }

    async fn process_job(
        &self,
        cancel: &CancellationToken,
        run_id: Uuid,
        aggregator: &StreamingAggregator,
        mut job: FileJob,
    ) -> FileOutcome {
        if cancel.is_cancelled() {
            return FileOutcome::Skipped;
        }

        job.mark_processing();
        if let Err(e) = self.repository.update_file_job(&job).await {
            cancel.cancel();
            return FileOutcome::Fatal(e);
        }

        match self.run_job(cancel, run_id, aggregator, &mut job).await {
            Ok(row_count) => {
                debug!(job_id = %job.id, file = %job.file_path, rows = row_count, "Processed file");
                FileOutcome::Completed
            },
            Err(e) => self.handle_job_error(cancel, job, e).await,
        }
    }

    /// Read, buffer and record one job; the job is marked completed in place
    async fn run_job(
        &self,
        cancel: &CancellationToken,
        run_id: Uuid,
        aggregator: &StreamingAggregator,
        job: &mut FileJob,
    ) -> Result<i64> {
        let rows = self.read_file(cancel, Path::new(&job.file_path)).await?;
        let row_count = rows.len() as i64;
        aggregator.add_file_data(cancel, rows).await?;

        job.mark_completed();
        self.repository.update_file_job(job).await?;
        self.repository.increment_processed_files(run_id).await?;
        self.repository.add_row_count(run_id, row_count).await?;
        Ok(row_count)
    }

    /// Batch-fatal errors cancel the rest of the batch; file errors fail the job
    async fn handle_job_error(
        &self,
        cancel: &CancellationToken,
        mut job: FileJob,
        err: PipelineError,
    ) -> FileOutcome {
        if err.is_cancelled() {
            return FileOutcome::Skipped;
        }

        if err.is_batch_fatal() {
            cancel.cancel();
            if job.status != JobStatus::Completed {
                job.mark_failed(err.to_string());
                if let Err(update) = self.repository.update_file_job(&job).await {
                    warn!(job_id = %job.id, file = %job.file_path, error = %update, "Could not record job failure");
                }
            }
            return FileOutcome::Fatal(err);
        }

        // A transform interrupted by cancellation is not a file failure.
        if cancel.is_cancelled() {
            return FileOutcome::Skipped;
        }
        self.fail_job(cancel, job, err).await
    }

    async fn replay_job(
        &self,
        cancel: &CancellationToken,
        aggregator: &StreamingAggregator,
        job: FileJob,
    ) -> FileOutcome {
        if cancel.is_cancelled() {
            return FileOutcome::Skipped;
        }

        let path = PathBuf::from(&job.file_path);
        let rows = match self.read_file(cancel, &path).await {
            Ok(rows) => rows,
            Err(_) if cancel.is_cancelled() => return FileOutcome::Skipped,
            Err(e) => {
                error!(job_id = %job.id, file = %job.file_path, error = %e, "Could not replay completed file");
                return FileOutcome::Failed(e.to_string());
            },
        };

        match aggregator.add_file_data(cancel, rows).await {
            Ok(()) => {
                debug!(job_id = %job.id, file = %job.file_path, "Replayed file");
                FileOutcome::Replayed
            },
            Err(e) if e.is_cancelled() => FileOutcome::Skipped,
            Err(e) => {
                cancel.cancel();
                FileOutcome::Fatal(e)
            },
        }
    }

    /// Validate then transform one file
    async fn read_file(
        &self,
        cancel: &CancellationToken,
        path: &Path,
    ) -> Result<Vec<TransformedRow>> {
        self.pipeline
            .validate(path)
            .await
            .map_err(|source| PipelineError::Validation {
                path: path.to_path_buf(),
                source,
            })?;

        self.pipeline
            .transform(cancel, path)
            .await
            .map_err(|source| PipelineError::Transform {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn fail_job(
        &self,
        cancel: &CancellationToken,
        mut job: FileJob,
        err: PipelineError,
    ) -> FileOutcome {
        let message = err.to_string();
        job.mark_failed(&message);

        if job.is_retryable(self.config.retry_attempts) {
            warn!(
                job_id = %job.id,
                file = %job.file_path,
                retry_count = job.retry_count,
                max_retries = self.config.retry_attempts,
                error = %message,
                "File failed, eligible for retry"
            );
        } else {
            error!(
                job_id = %job.id,
                file = %job.file_path,
                retry_count = job.retry_count,
                error = %message,
                "File failed after max retries"
            );
        }

        match self.repository.update_file_job(&job).await {
            Ok(()) => FileOutcome::Failed(message),
            Err(e) => {
                cancel.cancel();
                FileOutcome::Fatal(e)
            },
        }
    }

    /// Mark the run failed and hand back the error that caused it
    async fn fail_run(&self, run: &mut PipelineRun, err: PipelineError) -> PipelineError {
        error!(
            pipeline = %run.pipeline_name,
            date = %run.snapshot_date,
            run_id = %run.id,
            error = %err,
            "Run failed"
        );
        run.mark_failed(err.to_string());
        if let Err(update) = self.repository.update_run(run).await {
            error!(run_id = %run.id, error = %update, "Could not mark run failed");
        }
        err
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
