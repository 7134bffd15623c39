//! Run and file job persistence
//!
//! The repository is the system of record for run state across process
//! restarts. Counter updates are atomic on the store side so concurrent file
//! tasks never lose increments, and `update_run` never writes the counters.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod postgres;
pub mod types;

pub use memory::InMemoryRunRepository;
pub use postgres::PgRunRepository;
pub use types::{FileJob, JobStatus, NewPipelineRun, PipelineMetrics, PipelineRun, RunStatus};

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Look up the run for one (pipeline, date) key
    async fn find_run(&self, pipeline_name: &str, snapshot_date: NaiveDate)
        -> Result<Option<PipelineRun>>;

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun>;

    /// Create a `pending` run, or return the existing run for the same key
    async fn create_run(&self, new_run: NewPipelineRun) -> Result<PipelineRun>;

    /// Persist status, total files, completion timestamp and error message
    async fn update_run(&self, run: &PipelineRun) -> Result<()>;

    /// Create a `queued` job
    async fn create_file_job(
        &self,
        run_id: Uuid,
        file_path: &str,
        store_id: Option<&str>,
    ) -> Result<FileJob>;

    /// Persist status, error message, processed timestamp and retry count
    async fn update_file_job(&self, job: &FileJob) -> Result<()>;

    async fn file_jobs_for_run(&self, run_id: Uuid) -> Result<Vec<FileJob>>;

    /// Failed jobs of `pipeline_name` whose retry count is below `max_retries`
    async fn failed_file_jobs(&self, pipeline_name: &str, max_retries: u32)
        -> Result<Vec<FileJob>>;

    async fn increment_processed_files(&self, run_id: Uuid) -> Result<()>;

    async fn add_row_count(&self, run_id: Uuid, rows: i64) -> Result<()>;

    /// Run statistics for runs started at or after `since`
    async fn pipeline_stats(
        &self,
        pipeline_name: &str,
        since: DateTime<Utc>,
    ) -> Result<PipelineMetrics>;

    /// All pipelines' runs for one business date
    async fn runs_for_date(&self, snapshot_date: NaiveDate) -> Result<Vec<PipelineRun>>;
}
