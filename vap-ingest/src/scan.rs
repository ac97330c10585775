//! Workbook discovery, validation, and the metadata pre-scan
//!
//! The pre-scan reads every workbook's sheet names and header rows, assigns
//! each sheet a classification, and accumulates the per-classification
//! column unions the staging schemas are built from. A document whose scan
//! fails is recorded as scan-failed and excluded from ingestion, but still
//! counted in the run totals.

use crate::classify::classify;
use crate::types::{
    ErrorRecord, ErrorStage, SheetClass, TableSchema, AUDIT_IMPORT_TIME_COL, AUDIT_SRC_FILE_COL,
    HEADER_COLS_NEEDED, INVOICE_YEAR_COL, TAX_RATE_NUMERIC_COL,
};
use crate::workbook::WorkbookOpener;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One scanned workbook: per-sheet headers and classifications, immutable
/// once built.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub file_name: String,
    /// Sheets in workbook order with their header columns
    pub sheets: Vec<(String, Vec<String>)>,
    /// Sheet name -> classification
    pub classifications: BTreeMap<String, SheetClass>,
}

impl SourceDocument {
    pub fn classification(&self, sheet: &str) -> SheetClass {
        self.classifications
            .get(sheet)
            .cloned()
            .unwrap_or(SheetClass::Ignored)
    }
}

/// Per-classification column unions, already extended with the audit and
/// derived columns every staged row carries.
#[derive(Debug, Clone, Default)]
pub struct ClassColumns {
    /// Transit table schema (detail-classified sheets)
    pub detail: TableSchema,
    /// DETAIL staging schema (summary-classified sheets)
    pub summary: TableSchema,
    pub header: TableSchema,
    /// Special-category suffix -> schema
    pub special: BTreeMap<String, TableSchema>,
}

/// Pre-scan output
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub documents: Vec<SourceDocument>,
    /// File names whose metadata scan failed
    pub scan_failed: Vec<String>,
    /// (file name, reason) pairs rejected by validation
    pub skipped: Vec<(String, String)>,
    pub errors: Vec<ErrorRecord>,
    pub columns: ClassColumns,
}

/// Validate one candidate file before it enters the pipeline.
pub fn validate_input_file(path: &Path, max_file_mb: f64) -> std::result::Result<(), String> {
    if !path.is_file() {
        return Err("not a file".to_string());
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if file_name.starts_with("~$") {
        return Err("temporary excel lock file".to_string());
    }
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !matches!(extension.as_str(), "xls" | "xlsx" | "xlsm") {
        return Err("unsupported extension".to_string());
    }
    match path.metadata() {
        Ok(meta) => {
            let size_mb = meta.len() as f64 / (1024.0 * 1024.0);
            if max_file_mb > 0.0 && size_mb > max_file_mb {
                return Err(format!(
                    "file too large ({:.1}MB > {}MB limit)",
                    size_mb, max_file_mb
                ));
            }
        }
        Err(_) => return Err("size check failed".to_string()),
    }
    Ok(())
}

/// Recursively discover candidate workbook files under the input directory.
pub fn discover_files(input_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(input_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) if e.file_type().is_file() => {
                let ext = e
                    .path()
                    .extension()
                    .map(|x| x.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                matches!(ext.as_str(), "xls" | "xlsx" | "xlsm").then(|| e.path().to_path_buf())
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Error accessing entry: {}", e);
                None
            }
        })
        .collect();
    files.sort();
    files
}

fn push_unique(columns: &mut Vec<String>, candidates: &[String]) {
    for c in candidates {
        if !columns.iter().any(|existing| existing == c) {
            columns.push(c.clone());
        }
    }
}

/// Deterministic header-table column ordering: the standard business columns
/// first (in their fixed order), then every remaining observed column in
/// first-seen order.
fn reorder_header_columns(observed: Vec<String>) -> Vec<String> {
    let mut ordered: Vec<String> = HEADER_COLS_NEEDED
        .iter()
        .filter(|standard| observed.iter().any(|c| c == *standard))
        .map(|s| s.to_string())
        .collect();
    for c in observed {
        if !ordered.iter().any(|existing| *existing == c) {
            ordered.push(c);
        }
    }
    ordered
}

/// Scan validated files for sheet metadata and build the column unions.
pub fn scan_documents(
    opener: &dyn WorkbookOpener,
    input_dir: &Path,
    max_file_mb: f64,
) -> ScanOutcome {
    let candidates = discover_files(input_dir);
    tracing::info!(
        dir = %input_dir.display(),
        candidates = candidates.len(),
        "Scanning workbook files"
    );

    let mut outcome = ScanOutcome::default();
    let mut detail_cols: Vec<String> = Vec::new();
    let mut summary_cols: Vec<String> = Vec::new();
    let mut header_cols: Vec<String> = Vec::new();
    let mut special_cols: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for path in candidates {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if let Err(reason) = validate_input_file(&path, max_file_mb) {
            tracing::warn!(file = %file_name, reason = %reason, "Skipping file");
            outcome.skipped.push((file_name, reason));
            continue;
        }

        let mut workbook = match opener.open(&path) {
            Ok(wb) => wb,
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Metadata scan failed");
                outcome.errors.push(ErrorRecord::new(
                    &file_name,
                    "",
                    ErrorStage::Scan,
                    "OpenWorkbook",
                    e.to_string(),
                ));
                outcome.scan_failed.push(file_name);
                continue;
            }
        };

        let mut document = SourceDocument {
            path: path.clone(),
            file_name: file_name.clone(),
            sheets: Vec::new(),
            classifications: BTreeMap::new(),
        };

        for sheet in workbook.sheet_names() {
            let headers = match workbook.sheet_header(&sheet) {
                Ok(h) => h,
                Err(e) => {
                    // One unreadable sheet does not fail the document scan
                    tracing::warn!(file = %file_name, sheet = %sheet, error = %e, "Header read failed");
                    outcome.errors.push(ErrorRecord::new(
                        &file_name,
                        &sheet,
                        ErrorStage::Scan,
                        "ReadHeader",
                        e.to_string(),
                    ));
                    continue;
                }
            };

            let class = classify(&sheet, &headers);
            match &class {
                SheetClass::Detail => push_unique(&mut detail_cols, &headers),
                SheetClass::Summary => push_unique(&mut summary_cols, &headers),
                SheetClass::Header => push_unique(&mut header_cols, &headers),
                SheetClass::Special(suffix) => {
                    push_unique(special_cols.entry(suffix.clone()).or_default(), &headers)
                }
                SheetClass::Ignored => {}
            }
            document.classifications.insert(sheet.clone(), class);
            document.sheets.push((sheet, headers));
        }

        outcome.documents.push(document);
    }

    // Every staged row also carries the audit and derived columns
    let extra = [
        AUDIT_SRC_FILE_COL.to_string(),
        AUDIT_IMPORT_TIME_COL.to_string(),
        INVOICE_YEAR_COL.to_string(),
        TAX_RATE_NUMERIC_COL.to_string(),
    ];
    push_unique(&mut detail_cols, &extra);
    push_unique(&mut summary_cols, &extra);
    push_unique(&mut header_cols, &extra);
    for cols in special_cols.values_mut() {
        push_unique(cols, &extra[..3]);
    }

    outcome.columns = ClassColumns {
        detail: TableSchema::new(detail_cols),
        summary: TableSchema::new(summary_cols),
        header: TableSchema::new(reorder_header_columns(header_cols)),
        special: special_cols
            .into_iter()
            .map(|(suffix, cols)| (suffix, TableSchema::new(cols)))
            .collect(),
    };

    tracing::info!(
        documents = outcome.documents.len(),
        scan_failed = outcome.scan_failed.len(),
        skipped = outcome.skipped.len(),
        "Metadata scan complete"
    );
    outcome
}
