//! Spreadsheet drops
//!
//! Only the first sheet is read. Every cell becomes CSV text so the delimited
//! pipeline sees the same header-first layout a CSV export would have.

use anyhow::{bail, Context, Result};
use calamine::{open_workbook, Data, Reader, Xlsx};
use std::path::{Path, PathBuf};

/// Extension of spreadsheet files converted during fetch.
pub const XLSX_EXTENSION: &str = "xlsx";

/// Whether `name` is a spreadsheet that needs converting
pub fn is_xlsx(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(XLSX_EXTENSION))
}

/// Write the first sheet of `xlsx_path` to `csv_path`, returning the row count
pub fn convert_xlsx_to_csv(xlsx_path: &Path, csv_path: &Path) -> Result<usize> {
    let mut workbook: Xlsx<_> = open_workbook(xlsx_path)
        .with_context(|| format!("failed to open xlsx file {}", xlsx_path.display()))?;

    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        bail!("xlsx file {} has no sheets", xlsx_path.display());
    };
    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("failed to read sheet {} of {}", sheet, xlsx_path.display()))?;

    let mut writer = csv::Writer::from_path(csv_path)
        .with_context(|| format!("failed to create csv file {}", csv_path.display()))?;
    let mut rows = 0;
    for row in range.rows() {
        writer
            .write_record(row.iter().map(cell_text))
            .with_context(|| format!("failed to write csv row to {}", csv_path.display()))?;
        rows += 1;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", csv_path.display()))?;
    Ok(rows)
}

/// Convert on the blocking pool
pub async fn convert_xlsx_to_csv_async(xlsx_path: PathBuf, csv_path: PathBuf) -> Result<usize> {
    tokio::task::spawn_blocking(move || convert_xlsx_to_csv(&xlsx_path, &csv_path))
        .await
        .context("xlsx conversion task panicked")?
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(at) if at.time() == chrono::NaiveTime::MIN => at.format("%Y-%m-%d").to_string(),
            Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;
    use tempfile::TempDir;

    fn write_workbook(path: &Path) {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "sku").unwrap();
        sheet.write_string(0, 1, "qty").unwrap();
        sheet.write_string(0, 2, "store").unwrap();
        sheet.write_string(1, 0, "007").unwrap();
        sheet.write_number(1, 1, 3).unwrap();
        sheet.write_string(1, 2, "Padang, Sumbar").unwrap();
        sheet.write_string(2, 0, "B-2").unwrap();
        sheet.write_number(2, 1, 1.5).unwrap();
        workbook.save(path).unwrap();
    }

    #[test]
    fn test_converts_first_sheet() {
        let dir = TempDir::new().unwrap();
        let xlsx = dir.path().join("stock.xlsx");
        let csv = dir.path().join("stock.csv");
        write_workbook(&xlsx);

        let rows = convert_xlsx_to_csv(&xlsx, &csv).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(
            std::fs::read_to_string(&csv).unwrap(),
            "sku,qty,store\n007,3,\"Padang, Sumbar\"\nB-2,1.5,\n"
        );
    }

    #[test]
    fn test_rejects_non_spreadsheet() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.xlsx");
        std::fs::write(&bogus, "sku,qty\n").unwrap();

        let err = convert_xlsx_to_csv(&bogus, &dir.path().join("out.csv")).unwrap_err();
        assert!(err.to_string().contains("failed to open xlsx file"));
    }

    #[test]
    fn test_is_xlsx() {
        assert!(is_xlsx("Stock.XLSX"));
        assert!(!is_xlsx("stock.csv"));
    }
}
