//! PostgreSQL repository
//!
//! Tables are created by `migrations/20250101000000_pipeline_runs.sql`.
//! Status columns are TEXT and mapped through the enums' `as_str`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::types::{FileJob, NewPipelineRun, PipelineMetrics, PipelineRun, RunStatus};
use super::RunRepository;
use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};

const RUN_COLUMNS: &str = "id, pipeline_name, snapshot_date, status, total_files, \
     processed_files, total_rows, started_at, completed_at, error_message";

const JOB_COLUMNS: &str =
    "id, run_id, file_path, store_id, status, error_message, processed_at, retry_count";

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_name: String,
    snapshot_date: NaiveDate,
    status: String,
    total_files: i32,
    processed_files: i32,
    total_rows: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = PipelineError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(PipelineRun {
            id: row.id,
            pipeline_name: row.pipeline_name,
            snapshot_date: row.snapshot_date,
            status: row.status.parse()?,
            total_files: row.total_files,
            processed_files: row.processed_files,
            total_rows: row.total_rows,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    run_id: Uuid,
    file_path: String,
    store_id: Option<String>,
    status: String,
    error_message: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
}

impl TryFrom<JobRow> for FileJob {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(FileJob {
            id: row.id,
            run_id: row.run_id,
            file_path: row.file_path,
            store_id: row.store_id,
            status: row.status.parse()?,
            error_message: row.error_message,
            processed_at: row.processed_at,
            retry_count: row.retry_count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MetricsRow {
    total_runs: i64,
    completed_runs: i64,
    failed_runs: i64,
    total_rows: i64,
    last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from database settings
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PipelineError::Persistence(e.into()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = PipelineError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn find_run(
        &self,
        pipeline_name: &str,
        snapshot_date: NaiveDate,
    ) -> Result<Option<PipelineRun>> {
        let sql = format!(
            "SELECT {} FROM pipeline_runs WHERE pipeline_name = $1 AND snapshot_date = $2",
            RUN_COLUMNS
        );
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(pipeline_name)
            .bind(snapshot_date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PipelineRun::try_from).transpose()
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let sql = format!("SELECT {} FROM pipeline_runs WHERE id = $1", RUN_COLUMNS);
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                PipelineError::Repository(format!("pipeline run {} not found", run_id))
            })?;
        row.try_into()
    }

    async fn create_run(&self, new_run: NewPipelineRun) -> Result<PipelineRun> {
        let sql = format!(
            r#"
            INSERT INTO pipeline_runs (id, pipeline_name, snapshot_date, status, total_files)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (pipeline_name, snapshot_date) DO NOTHING
            RETURNING {}
            "#,
            RUN_COLUMNS
        );
        let inserted = sqlx::query_as::<_, RunRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new_run.pipeline_name)
            .bind(new_run.snapshot_date)
            .bind(RunStatus::Pending.as_str())
            .bind(new_run.total_files)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => row.try_into(),
            None => {
                debug!(
                    pipeline = %new_run.pipeline_name,
                    date = %new_run.snapshot_date,
                    "Run already exists, reusing it"
                );
                self.find_run(&new_run.pipeline_name, new_run.snapshot_date)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Repository(format!(
                            "run for {} on {} vanished after conflict",
                            new_run.pipeline_name, new_run.snapshot_date
                        ))
                    })
            },
        }
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1, total_files = $2, completed_at = $3, error_message = $4
            WHERE id = $5
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.total_files)
        .bind(run.completed_at)
        .bind(&run.error_message)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Repository(format!(
                "pipeline run {} not found",
                run.id
            )));
        }
        Ok(())
    }

    async fn create_file_job(
        &self,
        run_id: Uuid,
        file_path: &str,
        store_id: Option<&str>,
    ) -> Result<FileJob> {
        let sql = format!(
            r#"
            INSERT INTO pipeline_file_jobs (id, run_id, file_path, store_id, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(file_path)
            .bind(store_id)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn update_file_job(&self, job: &FileJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_file_jobs
            SET status = $1, error_message = $2, processed_at = $3, retry_count = $4
            WHERE id = $5
            "#,
        )
        .bind(job.status.as_str())
        .bind(&job.error_message)
        .bind(job.processed_at)
        .bind(job.retry_count)
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn file_jobs_for_run(&self, run_id: Uuid) -> Result<Vec<FileJob>> {
        let sql = format!(
            "SELECT {} FROM pipeline_file_jobs WHERE run_id = $1 ORDER BY created_at, file_path",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn failed_file_jobs(&self, pipeline_name: &str, max_retries: u32) -> Result<Vec<FileJob>> {
        let sql = r#"
            SELECT j.id, j.run_id, j.file_path, j.store_id, j.status,
                   j.error_message, j.processed_at, j.retry_count
            FROM pipeline_file_jobs j
            JOIN pipeline_runs r ON r.id = j.run_id
            WHERE r.pipeline_name = $1
              AND j.status = 'failed'
              AND j.retry_count < $2
            ORDER BY r.snapshot_date, j.created_at
        "#;
        let rows = sqlx::query_as::<_, JobRow>(sql)
            .bind(pipeline_name)
            .bind(i64::from(max_retries))
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn increment_processed_files(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET processed_files = processed_files + 1 WHERE id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_row_count(&self, run_id: Uuid, rows: i64) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET total_rows = total_rows + $1 WHERE id = $2")
            .bind(rows)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pipeline_stats(
        &self,
        pipeline_name: &str,
        since: DateTime<Utc>,
    ) -> Result<PipelineMetrics> {
        let row = sqlx::query_as::<_, MetricsRow>(
            r#"
            SELECT
                COUNT(*) AS total_runs,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_runs,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_runs,
                COALESCE(SUM(total_rows), 0)::BIGINT AS total_rows,
                MAX(completed_at) FILTER (WHERE status = 'completed') AS last_completed_at
            FROM pipeline_runs
            WHERE pipeline_name = $1 AND started_at >= $2
            "#,
        )
        .bind(pipeline_name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(PipelineMetrics {
            pipeline_name: pipeline_name.to_string(),
            total_runs: row.total_runs,
            completed_runs: row.completed_runs,
            failed_runs: row.failed_runs,
            total_rows: row.total_rows,
            last_completed_at: row.last_completed_at,
        })
    }

    async fn runs_for_date(&self, snapshot_date: NaiveDate) -> Result<Vec<PipelineRun>> {
        let sql = format!(
            "SELECT {} FROM pipeline_runs WHERE snapshot_date = $1 ORDER BY pipeline_name",
            RUN_COLUMNS
        );
        let rows = sqlx::query_as::<_, RunRow>(&sql)
            .bind(snapshot_date)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }
}
