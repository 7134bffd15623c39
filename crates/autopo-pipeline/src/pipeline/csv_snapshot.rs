//! Generic delimited-file snapshot pipeline
//!
//! Reads a header-first CSV drop and emits one row per record with typed
//! values. Every row is tagged with the file's business date and source file
//! name so downstream loads can replace a single file's rows.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::row::{FieldValue, TransformedRow};
use super::{parse_filename_date, Pipeline, DEFAULT_DATE_LAYOUT};

/// Column added to every row with the snapshot date (`YYYY-MM-DD`).
pub const SNAPSHOT_DATE_COLUMN: &str = "snapshot_date";

/// Column added to every row with the input file name.
pub const SOURCE_FILE_COLUMN: &str = "source_file";

const CANCEL_CHECK_INTERVAL: usize = 1_000;

#[derive(Debug, Clone)]
pub struct CsvSnapshotPipeline {
    name: String,
    output_table: String,
    date_layout: String,
    required_columns: Vec<String>,
    text_columns: Vec<String>,
    delimiter: u8,
    extensions: Vec<String>,
}

impl CsvSnapshotPipeline {
    /// A pipeline whose output table defaults to its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            output_table: name.clone(),
            name,
            date_layout: DEFAULT_DATE_LAYOUT.to_string(),
            required_columns: Vec::new(),
            text_columns: Vec::new(),
            delimiter: b',',
            extensions: vec!["csv".to_string()],
        }
    }

    pub fn with_output_table(mut self, table: impl Into<String>) -> Self {
        self.output_table = table.into();
        self
    }

    pub fn with_date_layout(mut self, layout: impl Into<String>) -> Self {
        self.date_layout = layout.into();
        self
    }

    pub fn with_required_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Columns kept verbatim as text, e.g. SKU or store codes
    pub fn with_text_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.into().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn date_layout(&self) -> &str {
        &self.date_layout
    }

    pub fn text_columns(&self) -> &[String] {
        &self.text_columns
    }

    fn reader<'a>(&self, bytes: &'a [u8]) -> csv::Reader<&'a [u8]> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::Headers)
            .from_reader(bytes)
    }

    fn check_extension(&self, path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.extensions.iter().any(|allowed| *allowed == ext) {
            bail!(
                "unsupported file extension {:?}, expected one of {:?}",
                ext,
                self.extensions
            );
        }
        Ok(())
    }

    fn check_headers(&self, headers: &csv::StringRecord) -> Result<()> {
        if headers.iter().all(|h| h.is_empty()) {
            bail!("missing header row");
        }
        let missing: Vec<&str> = self
            .required_columns
            .iter()
            .filter(|required| !headers.iter().any(|h| h == required.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            bail!("missing required columns: {}", missing.join(", "));
        }
        Ok(())
    }
}

#[async_trait]
impl Pipeline for CsvSnapshotPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, path: &Path) -> Result<()> {
        self.check_extension(path)?;

        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        if metadata.len() == 0 {
            bail!("{} is empty", path.display());
        }

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let mut reader = self.reader(&bytes);
        let headers = reader.headers().context("unreadable header row")?;
        self.check_headers(headers)
    }

    async fn transform(
        &self,
        cancel: &CancellationToken,
        path: &Path,
    ) -> Result<Vec<TransformedRow>> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("input path has no file name")?
            .to_string();
        let snapshot_date = self.snapshot_date(&filename)?;

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let mut reader = self.reader(&bytes);
        let headers = reader.headers().context("unreadable header row")?.clone();
        self.check_headers(&headers)?;

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            if index % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                bail!("transform of {} cancelled", filename);
            }

            // Line numbers are 1-based and the header is line 1.
            let record = record.with_context(|| format!("malformed record at line {}", index + 2))?;
            let mut row = TransformedRow::with_capacity(headers.len() + 2);
            for (column, raw) in headers.iter().zip(record.iter()) {
                let value = if self.text_columns.iter().any(|text| text == column) {
                    FieldValue::text(raw)
                } else {
                    FieldValue::infer(raw)
                };
                row.insert(column, value);
            }
            row.insert(SNAPSHOT_DATE_COLUMN, snapshot_date.format("%Y-%m-%d").to_string());
            row.insert(SOURCE_FILE_COLUMN, filename.as_str());
            rows.push(row);
        }

        debug!(file = %filename, rows = rows.len(), "Transformed file");
        Ok(rows)
    }

    fn output_table(&self) -> &str {
        &self.output_table
    }

    fn snapshot_date(&self, filename: &str) -> Result<NaiveDate> {
        parse_filename_date(filename, &self.date_layout)
    }
}
