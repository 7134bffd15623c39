//! Downstream snapshot loader
//!
//! Flush callback that reads an artifact back and loads it into
//! `pipeline_snapshot_rows`. Rows carrying a `source_file` column replace that
//! file's previous rows for the same table and date, so reloading a file
//! after a retry or a repeated flush never duplicates it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::FlushCallback;
use crate::pipeline::csv_snapshot::SOURCE_FILE_COLUMN;
use crate::pipeline::{parse_filename_date, FieldValue};

const INSERT_CHUNK_ROWS: usize = 1_000;

/// Artifact contents as JSON documents
#[derive(Debug, Default, PartialEq)]
pub struct ArtifactRows {
    pub rows: Vec<(Option<String>, serde_json::Value)>,
    pub source_files: BTreeSet<String>,
}

/// Parse an artifact written by the aggregator
///
/// Cells are re-typed with the same inference the CSV pipeline uses, except
/// `text_columns` which stay strings. Empty cells become JSON nulls.
pub fn parse_artifact(bytes: &[u8], text_columns: &[String]) -> Result<ArtifactRows> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader.headers().context("artifact has no header row")?.clone();

    let mut parsed = ArtifactRows::default();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("malformed artifact row {}", index + 1))?;
        let mut document = serde_json::Map::with_capacity(headers.len());
        let mut source_file = None;

        for (column, raw) in headers.iter().zip(record.iter()) {
            if column == SOURCE_FILE_COLUMN && !raw.is_empty() {
                source_file = Some(raw.to_string());
            }
            let value = if text_columns.iter().any(|text| text == column) {
                FieldValue::text(raw)
            } else {
                FieldValue::infer(raw)
            };
            document.insert(column.to_string(), value.to_json());
        }

        if let Some(file) = &source_file {
            parsed.source_files.insert(file.clone());
        }
        parsed
            .rows
            .push((source_file, serde_json::Value::Object(document)));
    }
    Ok(parsed)
}

pub struct SnapshotLoader {
    pool: PgPool,
    output_table: String,
    text_columns: Vec<String>,
}

impl SnapshotLoader {
    pub fn new(pool: PgPool, output_table: impl Into<String>) -> Self {
        Self {
            pool,
            output_table: output_table.into(),
            text_columns: Vec::new(),
        }
    }

    /// Columns loaded as JSON strings whatever they look like
    pub fn with_text_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        snapshot_date: NaiveDate,
        artifact: ArtifactRows,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin load")?;

        if !artifact.source_files.is_empty() {
            let files: Vec<String> = artifact.source_files.iter().cloned().collect();
            let deleted = sqlx::query(
                r#"
                DELETE FROM pipeline_snapshot_rows
                WHERE output_table = $1 AND snapshot_date = $2 AND source_file = ANY($3)
                "#,
            )
            .bind(&self.output_table)
            .bind(snapshot_date)
            .bind(&files)
            .execute(&mut *tx)
            .await
            .context("Failed to clear previous rows")?;
            if deleted.rows_affected() > 0 {
                info!(
                    table = %self.output_table,
                    date = %snapshot_date,
                    replaced = deleted.rows_affected(),
                    "Replacing previously loaded rows"
                );
            }
        }

        for chunk in artifact.rows.chunks(INSERT_CHUNK_ROWS) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO pipeline_snapshot_rows (output_table, snapshot_date, source_file, row_data) ",
            );
            query_builder.push_values(chunk, |mut b, (source_file, document)| {
                b.push_bind(&self.output_table)
                    .push_bind(snapshot_date)
                    .push_bind(source_file.as_deref())
                    .push_bind(sqlx::types::Json(document));
            });
            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert snapshot rows")?;
        }

        if cancel.is_cancelled() {
            tx.rollback().await.ok();
            anyhow::bail!("load of {} on {} cancelled", self.output_table, snapshot_date);
        }

        tx.commit().await.context("Failed to commit load")?;
        Ok(())
    }
}

#[async_trait]
impl FlushCallback for SnapshotLoader {
    async fn on_flush(&self, cancel: &CancellationToken, artifact_path: &Path) -> Result<()> {
        let name = artifact_path
            .file_name()
            .and_then(|name| name.to_str())
            .context("artifact path has no file name")?;
        let snapshot_date = parse_filename_date(name, "%Y%m%d")?;

        let bytes = tokio::fs::read(artifact_path)
            .await
            .with_context(|| format!("Failed to read artifact {}", artifact_path.display()))?;
        let artifact = parse_artifact(&bytes, &self.text_columns)?;
        let row_count = artifact.rows.len();

        self.load(cancel, snapshot_date, artifact).await?;

        info!(
            table = %self.output_table,
            date = %snapshot_date,
            rows = row_count,
            "Loaded snapshot rows"
        );
        Ok(())
    }
}
