//! In-process repository used by dry runs and tests

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{FileJob, JobStatus, NewPipelineRun, PipelineMetrics, PipelineRun, RunStatus};
use super::RunRepository;
use crate::error::{PipelineError, Result};

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, PipelineRun>,
    // Insertion order, so listings are stable.
    jobs: Vec<FileJob>,
}

/// Repository holding every record in memory behind one lock
#[derive(Default)]
pub struct InMemoryRunRepository {
    state: Mutex<State>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run, oldest first
    pub async fn runs(&self) -> Vec<PipelineRun> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state.runs.values().cloned().collect();
        runs.sort_by_key(|run| (run.started_at, run.snapshot_date));
        runs
    }

    pub async fn jobs(&self) -> Vec<FileJob> {
        self.state.lock().await.jobs.clone()
    }
}

fn missing_run(run_id: Uuid) -> PipelineError {
    PipelineError::Repository(format!("pipeline run {} not found", run_id))
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn find_run(
        &self,
        pipeline_name: &str,
        snapshot_date: NaiveDate,
    ) -> Result<Option<PipelineRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .find(|run| run.pipeline_name == pipeline_name && run.snapshot_date == snapshot_date)
            .cloned())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let state = self.state.lock().await;
        state.runs.get(&run_id).cloned().ok_or_else(|| missing_run(run_id))
    }

    async fn create_run(&self, new_run: NewPipelineRun) -> Result<PipelineRun> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.runs.values().find(|run| {
            run.pipeline_name == new_run.pipeline_name && run.snapshot_date == new_run.snapshot_date
        }) {
            return Ok(existing.clone());
        }

        let run = PipelineRun {
            id: Uuid::new_v4(),
            pipeline_name: new_run.pipeline_name,
            snapshot_date: new_run.snapshot_date,
            status: RunStatus::Pending,
            total_files: new_run.total_files,
            processed_files: 0,
            total_rows: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.runs.get_mut(&run.id).ok_or_else(|| missing_run(run.id))?;
        stored.status = run.status;
        stored.total_files = run.total_files;
        stored.completed_at = run.completed_at;
        stored.error_message = run.error_message.clone();
        Ok(())
    }

    async fn create_file_job(
        &self,
        run_id: Uuid,
        file_path: &str,
        store_id: Option<&str>,
    ) -> Result<FileJob> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&run_id) {
            return Err(missing_run(run_id));
        }

        let job = FileJob {
            id: Uuid::new_v4(),
            run_id,
            file_path: file_path.to_string(),
            store_id: store_id.map(str::to_string),
            status: JobStatus::Queued,
            error_message: None,
            processed_at: None,
            retry_count: 0,
        };
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn update_file_job(&self, job: &FileJob) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .iter_mut()
            .find(|stored| stored.id == job.id)
            .ok_or_else(|| PipelineError::Repository(format!("file job {} not found", job.id)))?;
        stored.status = job.status;
        stored.error_message = job.error_message.clone();
        stored.processed_at = job.processed_at;
        stored.retry_count = job.retry_count;
        Ok(())
    }

    async fn file_jobs_for_run(&self, run_id: Uuid) -> Result<Vec<FileJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn failed_file_jobs(&self, pipeline_name: &str, max_retries: u32) -> Result<Vec<FileJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.is_retryable(max_retries))
            .filter(|job| {
                state
                    .runs
                    .get(&job.run_id)
                    .is_some_and(|run| run.pipeline_name == pipeline_name)
            })
            .cloned()
            .collect())
    }

    async fn increment_processed_files(&self, run_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&run_id).ok_or_else(|| missing_run(run_id))?;
        run.processed_files += 1;
        Ok(())
    }

    async fn add_row_count(&self, run_id: Uuid, rows: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&run_id).ok_or_else(|| missing_run(run_id))?;
        run.total_rows += rows;
        Ok(())
    }

    async fn pipeline_stats(
        &self,
        pipeline_name: &str,
        since: DateTime<Utc>,
    ) -> Result<PipelineMetrics> {
        let state = self.state.lock().await;
        let mut metrics = PipelineMetrics {
            pipeline_name: pipeline_name.to_string(),
            ..Default::default()
        };

        for run in state
            .runs
            .values()
            .filter(|run| run.pipeline_name == pipeline_name && run.started_at >= since)
        {
            metrics.total_runs += 1;
            metrics.total_rows += run.total_rows;
            match run.status {
                RunStatus::Completed => {
                    metrics.completed_runs += 1;
                    metrics.last_completed_at = metrics.last_completed_at.max(run.completed_at);
                },
                RunStatus::Failed => metrics.failed_runs += 1,
                RunStatus::Pending | RunStatus::Processing => {},
            }
        }

        Ok(metrics)
    }

    async fn runs_for_date(&self, snapshot_date: NaiveDate) -> Result<Vec<PipelineRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|run| run.snapshot_date == snapshot_date)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.pipeline_name.cmp(&b.pipeline_name));
        Ok(runs)
    }
}
