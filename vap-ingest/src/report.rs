//! Run exports: manifests, summary, error logs, duplicate lists
//!
//! Every export lands in the output directory, stamped with the run
//! timestamp. Exports are best-effort: a failed export is logged and
//! recorded but never aborts the run.

use crate::ledger::LedgerManifestRow;
use crate::types::{
    CastFailure, CastStat, ErrorRecord, ErrorStage, RunSummary, SheetManifestEntry, SheetRows,
    Value, AUDIT_IMPORT_TIME_COL,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use vap_common::{Error, Result};

pub const MANIFEST_PREFIX: &str = "ods_sheet_manifest";
pub const CAST_STATS_PREFIX: &str = "ods_type_cast_manifest";
pub const CAST_FAILURES_PREFIX: &str = "ods_type_cast_failures";
pub const ERROR_LOG_PREFIX: &str = "process_error_logs";
pub const IMPORT_SUMMARY_PREFIX: &str = "ods_import_summary";
pub const LEDGER_MANIFEST_PREFIX: &str = "invoice_ledgers_manifest";
pub const DUPLICATES_DETAIL_PREFIX: &str = "duplicates_detail";
pub const DUPLICATES_HEADER_PREFIX: &str = "duplicates_header";

/// Best-effort remedy suggestion for one error, keyed by category.
pub fn suggest_remedy(stage: ErrorStage, kind: &str, message: &str) -> String {
    let by_kind = match kind {
        "OpenWorkbook" | "CorruptWorkbook" => {
            "Workbook may be corrupt or in an unsupported format; verify it opens in a spreadsheet application."
        }
        "FileNotFound" => "Check that the file path exists (confirm file name and directory).",
        "Permission" => "Check read/write permissions and whether another process holds a lock on the file.",
        "Memory" => "Data volume may be too large; lower the chunk sizes or let streaming mode engage.",
        "MissingColumn" => "An expected column is absent; check the source sheet headers.",
        "Encoding" => "File encoding mismatch; re-save the source as UTF-8 or check its origin.",
        _ => "",
    };
    if !by_kind.is_empty() {
        return by_kind.to_string();
    }

    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        return "Check read/write permissions and whether another process holds a lock on the file.".to_string();
    }
    if lower.contains("not found") || lower.contains("no such file") {
        return "Check that the file path exists (confirm file name and directory).".to_string();
    }
    if lower.contains("corrupt") || lower.contains("invalid") {
        return "Workbook may be corrupt or in an unsupported format; verify it opens in a spreadsheet application.".to_string();
    }
    if lower.contains("lock") {
        return "Close applications that may be holding the file open, then rerun.".to_string();
    }

    match stage {
        ErrorStage::Cast => {
            "Value format did not match the expected type; inspect the recorded failure samples.".to_string()
        }
        ErrorStage::MergeChunk | ErrorStage::MergeGroup | ErrorStage::Transaction => {
            "Check database file permissions and free disk space, then rerun; staged data is rebuilt each run.".to_string()
        }
        ErrorStage::WriteShard => {
            "Check free disk space and permissions under the output directory.".to_string()
        }
        _ => String::new(),
    }
}

fn export_path(output_dir: &Path, prefix: &str, stamp: &str, extension: &str) -> PathBuf {
    output_dir.join(format!("{}_{}.{}", prefix, stamp, extension))
}

fn write_csv_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| Error::Internal(format!("csv open: {}", e)))?;
    for record in records {
        writer
            .serialize(record)
            .map_err(|e| Error::Internal(format!("csv write: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| Error::Internal(format!("csv flush: {}", e)))?;
    Ok(())
}

fn write_csv_rows(path: &Path, rows: &SheetRows) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| Error::Internal(format!("csv open: {}", e)))?;
    writer
        .write_record(&rows.columns)
        .map_err(|e| Error::Internal(format!("csv write: {}", e)))?;
    for row in &rows.rows {
        let record: Vec<String> = row.iter().map(Value::to_canonical_string).collect();
        writer
            .write_record(&record)
            .map_err(|e| Error::Internal(format!("csv write: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| Error::Internal(format!("csv flush: {}", e)))?;
    Ok(())
}

/// Export the per-sheet manifest.
pub fn export_sheet_manifest(
    output_dir: &Path,
    stamp: &str,
    entries: &[SheetManifestEntry],
) -> Result<PathBuf> {
    let path = export_path(output_dir, MANIFEST_PREFIX, stamp, "csv");
    write_csv_records(&path, entries)?;
    tracing::info!(path = %path.display(), entries = entries.len(), "Sheet manifest exported");
    Ok(path)
}

/// Export conversion statistics.
pub fn export_cast_stats(output_dir: &Path, stamp: &str, stats: &[CastStat]) -> Result<PathBuf> {
    let path = export_path(output_dir, CAST_STATS_PREFIX, stamp, "csv");
    write_csv_records(&path, stats)?;
    tracing::info!(path = %path.display(), entries = stats.len(), "Cast stats exported");
    Ok(path)
}

/// Export failure samples, capped per column so the export stays bounded
/// even when many workers contributed samples for the same column.
pub fn export_cast_failures(
    output_dir: &Path,
    stamp: &str,
    failures: &[CastFailure],
    max_per_column: usize,
) -> Result<PathBuf> {
    let mut per_column: HashMap<&str, usize> = HashMap::new();
    let limited: Vec<&CastFailure> = failures
        .iter()
        .filter(|f| {
            let count = per_column.entry(f.column.as_str()).or_insert(0);
            *count += 1;
            *count <= max_per_column
        })
        .collect();

    let path = export_path(output_dir, CAST_FAILURES_PREFIX, stamp, "csv");
    write_csv_records(&path, &limited)?;
    tracing::info!(
        path = %path.display(),
        samples = limited.len(),
        total = failures.len(),
        "Cast failure samples exported"
    );
    Ok(path)
}

/// Export the run summary.
pub fn export_summary(output_dir: &Path, stamp: &str, summary: &RunSummary) -> Result<PathBuf> {
    let path = export_path(output_dir, IMPORT_SUMMARY_PREFIX, stamp, "csv");
    write_csv_records(&path, std::slice::from_ref(summary))?;
    tracing::info!(path = %path.display(), "Import summary exported");
    Ok(path)
}

/// Export the structured error log as CSV plus JSON.
pub fn export_error_logs(
    output_dir: &Path,
    stamp: &str,
    errors: &[ErrorRecord],
) -> Result<(PathBuf, PathBuf)> {
    let csv_path = export_path(output_dir, ERROR_LOG_PREFIX, stamp, "csv");
    write_csv_records(&csv_path, errors)?;

    let json_path = export_path(output_dir, ERROR_LOG_PREFIX, stamp, "json");
    let json = serde_json::to_string_pretty(errors)
        .map_err(|e| Error::Internal(format!("json: {}", e)))?;
    fs::write(&json_path, json)?;

    tracing::info!(
        csv = %csv_path.display(),
        json = %json_path.display(),
        entries = errors.len(),
        "Error logs exported"
    );
    Ok((csv_path, json_path))
}

/// Export one duplicate list (detail or header), stamping the import-time
/// column when the staged rows somehow lack it.
pub fn export_duplicates(
    output_dir: &Path,
    stamp: &str,
    prefix: &str,
    duplicates: &SheetRows,
    process_time: &str,
) -> Result<Option<PathBuf>> {
    if duplicates.is_empty() {
        return Ok(None);
    }
    let mut rows = duplicates.clone();
    if rows.column_index(AUDIT_IMPORT_TIME_COL).is_none() {
        rows.columns.push(AUDIT_IMPORT_TIME_COL.to_string());
        for row in rows.rows.iter_mut() {
            row.push(Value::Text(process_time.to_string()));
        }
    }
    let path = export_path(output_dir, prefix, stamp, "csv");
    write_csv_rows(&path, &rows)?;
    tracing::info!(path = %path.display(), rows = rows.len(), "Duplicate export written");
    Ok(Some(path))
}

/// Export the per-year ledger manifest.
pub fn export_ledger_manifest(
    output_dir: &Path,
    stamp: &str,
    manifest: &[LedgerManifestRow],
) -> Result<PathBuf> {
    let path = export_path(output_dir, LEDGER_MANIFEST_PREFIX, stamp, "csv");
    write_csv_records(&path, manifest)?;
    tracing::info!(path = %path.display(), entries = manifest.len(), "Ledger manifest exported");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remedies_cover_common_kinds() {
        assert!(!suggest_remedy(ErrorStage::Scan, "OpenWorkbook", "").is_empty());
        assert!(!suggest_remedy(ErrorStage::ReadSheet, "", "Permission denied").is_empty());
        assert!(!suggest_remedy(ErrorStage::Cast, "", "weird").is_empty());
        assert_eq!(suggest_remedy(ErrorStage::Scan, "", "weird"), "");
    }

    #[test]
    fn cast_failures_capped_per_column() {
        let dir = tempfile::tempdir().unwrap();
        let failures: Vec<CastFailure> = (0..30)
            .map(|i| CastFailure {
                file: "f".into(),
                sheet: "s".into(),
                column: if i % 2 == 0 { "a" } else { "b" }.into(),
                row_index: i,
                orig_value: "x".into(),
                invoice_code: None,
                invoice_number: None,
            })
            .collect();
        let path = export_cast_failures(dir.path(), "stamp", &failures, 5).unwrap();
        let content = fs::read_to_string(path).unwrap();
        // Header + 5 per column
        assert_eq!(content.lines().count(), 1 + 10);
    }

    #[test]
    fn error_logs_written_as_csv_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let errors = vec![ErrorRecord::new(
            "a.xlsx",
            "明细",
            ErrorStage::ReadSheet,
            "OpenWorkbook",
            "corrupt",
        )];
        let (csv_path, json_path) = export_error_logs(dir.path(), "stamp", &errors).unwrap();
        assert!(csv_path.exists());
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(json[0]["file"], "a.xlsx");
        assert!(json[0]["suggestion"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn duplicate_export_adds_import_time_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut duplicates = SheetRows::new(vec!["发票代码".into()]);
        duplicates.rows.push(vec![Value::Text("A1".into())]);

        let path = export_duplicates(
            dir.path(),
            "stamp",
            DUPLICATES_DETAIL_PREFIX,
            &duplicates,
            "2024-01-15 10:30:00",
        )
        .unwrap()
        .unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains(AUDIT_IMPORT_TIME_COL));
        assert!(content.contains("2024-01-15 10:30:00"));

        let empty = SheetRows::default();
        assert!(export_duplicates(dir.path(), "s", "p", &empty, "t")
            .unwrap()
            .is_none());
    }
}
