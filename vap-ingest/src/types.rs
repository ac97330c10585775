//! Core vocabulary for the ingestion and consolidation engine
//!
//! Rows are carried as an explicit ordered schema plus value vectors, so a
//! missing column is a defined state (`Value::Null`) rather than an absent
//! key. All business column names are the Chinese headers the source
//! workbooks actually carry.

use serde::Serialize;
use std::path::PathBuf;

// ============================================================================
// Column constants
// ============================================================================

/// Audit column: originating workbook file name
pub const AUDIT_SRC_FILE_COL: &str = "AUDIT_SRC_FILE";
/// Audit column: run timestamp at import time
pub const AUDIT_IMPORT_TIME_COL: &str = "AUDIT_IMPORT_TIME";
/// Audit column on duplicate exports: when the dedup pass found the row
pub const DEDUP_CAPTURE_TIME_COL: &str = "DEDUP_CAPTURE_TIME";
/// Derived column: first four characters of the invoice date
pub const INVOICE_YEAR_COL: &str = "开票年份";

pub const INVOICE_CODE_COL: &str = "发票代码";
pub const INVOICE_NUMBER_COL: &str = "发票号码";
pub const ETICKET_NUMBER_COL: &str = "数电发票号码";
pub const INVOICE_DATE_COL: &str = "开票日期";

/// Tax-rate column and its always-produced numeric companion
pub const TAX_RATE_COL: &str = "税率";
pub const TAX_RATE_NUMERIC_COL: &str = "税率_数值";

/// Date columns the normalizer targets
pub const DATE_COLS: &[&str] = &[INVOICE_DATE_COL];

/// Numeric columns the normalizer targets (tax rate is special-cased)
pub const NUMERIC_COLS: &[&str] = &["金额", "税额", "单价", "数量", "价税合计", TAX_RATE_COL];

/// Composite dedup key for detail rows: invoice identifiers + date +
/// line-item identity fields
pub const DETAIL_DEDUP_COLS: &[&str] = &[
    INVOICE_CODE_COL,
    INVOICE_NUMBER_COL,
    ETICKET_NUMBER_COL,
    INVOICE_DATE_COL,
    "货物或应税劳务名称",
    "数量",
    "单价",
    "金额",
    "税额",
    "发票票种",
    "发票状态",
    "开票人",
    "备注",
];

/// Composite dedup key for header rows: invoice identifiers only
pub const HEADER_DEDUP_COLS: &[&str] = &[INVOICE_CODE_COL, INVOICE_NUMBER_COL, ETICKET_NUMBER_COL];

/// Output column set for detail ledger partitions
pub const DETAIL_COLS_NEEDED: &[&str] = &[
    INVOICE_CODE_COL,
    INVOICE_NUMBER_COL,
    ETICKET_NUMBER_COL,
    "销方识别号",
    "销方名称",
    "购方识别号",
    "购买方名称",
    INVOICE_DATE_COL,
    "税收分类编码",
    "特定业务类型",
    "货物或应税劳务名称",
    "规格型号",
    "单位",
    "数量",
    "单价",
    "金额",
    TAX_RATE_COL,
    TAX_RATE_NUMERIC_COL,
    "税额",
    "价税合计",
    "发票来源",
    "发票票种",
    "发票状态",
    "是否正数发票",
    "发票风险等级",
    "开票人",
    "备注",
    AUDIT_SRC_FILE_COL,
    AUDIT_IMPORT_TIME_COL,
];

/// Output column set for header ledger partitions
pub const HEADER_COLS_NEEDED: &[&str] = &[
    INVOICE_CODE_COL,
    INVOICE_NUMBER_COL,
    ETICKET_NUMBER_COL,
    "销方识别号",
    "销方名称",
    "购方识别号",
    "购买方名称",
    INVOICE_DATE_COL,
    "金额",
    TAX_RATE_COL,
    TAX_RATE_NUMERIC_COL,
    "税额",
    "价税合计",
    "发票来源",
    "发票票种",
    "发票状态",
    "是否正数发票",
    "发票风险等级",
    "开票人",
    "备注",
    AUDIT_SRC_FILE_COL,
    AUDIT_IMPORT_TIME_COL,
];

/// Delimiter between segments of a shard file name
pub const SHARD_NAME_DELIMITER: &str = "__";
/// Temp directory root under the output dir for shard files
pub const TEMP_DIR_PREFIX: &str = "tmp_imports";

// ============================================================================
// Values and sheets
// ============================================================================

/// A single normalized cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrowed text content, `None` for null/number
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Canonical string form, used for CSV shards and dedup keys.
    ///
    /// Integral numbers render without a fractional part so that a value
    /// takes the same form whichever code path produced it.
    pub fn to_canonical_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
        }
    }
}

/// One sheet's worth of rows with its ordered header.
#[derive(Debug, Clone, Default)]
pub struct SheetRows {
    /// Ordered column names as found in the sheet's first row
    pub columns: Vec<String>,
    /// Row-major values, each row as long as `columns`
    pub rows: Vec<Vec<Value>>,
}

impl SheetRows {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// True when every cell in the row is null or blank text
    pub fn row_is_blank(row: &[Value]) -> bool {
        row.iter().all(|v| match v {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            Value::Number(_) => false,
        })
    }

    /// Reorder/extend rows to a target schema; unknown target columns
    /// become nulls, extra source columns are dropped.
    pub fn reindex(&self, target: &TableSchema) -> SheetRows {
        let indices: Vec<Option<usize>> = target
            .columns
            .iter()
            .map(|c| self.column_index(c))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| match idx {
                        Some(i) => row.get(*i).cloned().unwrap_or(Value::Null),
                        None => Value::Null,
                    })
                    .collect()
            })
            .collect();
        SheetRows {
            columns: target.columns.clone(),
            rows,
        }
    }
}

/// Ordered column list for one destination table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Sheet classification, evaluated in fixed priority order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SheetClass {
    /// Category-specific invoice sub-type (railway tickets, tolls, ...)
    Special(String),
    /// Consolidated line rows ("信息汇总" sheets)
    Summary,
    /// Invoice header sheets
    Header,
    /// Raw line dumps, staged to the transit table
    Detail,
    /// No pattern matched; skipped without error
    Ignored,
}

impl SheetClass {
    /// Manifest label, e.g. `special_railway` / `summary` / `ignored`
    pub fn label(&self) -> String {
        match self {
            SheetClass::Special(suffix) => format!("special_{}", suffix.to_lowercase()),
            SheetClass::Summary => "summary".to_string(),
            SheetClass::Header => "header".to_string(),
            SheetClass::Detail => "detail".to_string(),
            SheetClass::Ignored => "ignored".to_string(),
        }
    }
}

// ============================================================================
// Shards and manifests
// ============================================================================

/// A temporary, self-describing interchange file produced by one worker for
/// one sheet, destined for exactly one staging table.
#[derive(Debug, Clone)]
pub struct ShardDescriptor {
    pub path: PathBuf,
    pub target_table: String,
    pub source_file: String,
    pub source_sheet: String,
    pub rows: usize,
}

/// One manifest line per (file, sheet)
#[derive(Debug, Clone, Serialize)]
pub struct SheetManifestEntry {
    pub file: String,
    pub sheet: String,
    pub classification: String,
    pub columns: String,
    pub target_table: String,
    pub rows: Option<usize>,
}

/// Per-run totals exposed to collaborators
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_files: usize,
    pub processed_files: usize,
    pub scan_failed_files: String,
    pub read_failed_files: String,
    pub process_time: String,
}

// ============================================================================
// Normalization bookkeeping
// ============================================================================

/// One conversion-statistics line per (file, sheet, column, method)
#[derive(Debug, Clone, Serialize)]
pub struct CastStat {
    pub file: String,
    pub sheet: String,
    pub column: String,
    pub method: String,
    pub total: usize,
    pub converted: usize,
    pub failed: usize,
}

/// One recorded failure sample (bounded per column)
#[derive(Debug, Clone, Serialize)]
pub struct CastFailure {
    pub file: String,
    pub sheet: String,
    pub column: String,
    pub row_index: usize,
    pub orig_value: String,
    pub invoice_code: Option<String>,
    pub invoice_number: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Pipeline stage an error was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Scan,
    Metadata,
    OpenWorkbook,
    ReadSheet,
    Cast,
    WriteShard,
    MergeChunk,
    MergeGroup,
    Transaction,
    Export,
}

impl ErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Scan => "scan",
            ErrorStage::Metadata => "metadata",
            ErrorStage::OpenWorkbook => "open_workbook",
            ErrorStage::ReadSheet => "read_sheet",
            ErrorStage::Cast => "cast",
            ErrorStage::WriteShard => "write_shard",
            ErrorStage::MergeChunk => "merge_chunk",
            ErrorStage::MergeGroup => "merge_group",
            ErrorStage::Transaction => "transaction",
            ErrorStage::Export => "export",
        }
    }
}

/// Structured error entry; accumulated throughout the run, never blocking,
/// exported once at the end.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub file: String,
    pub sheet: String,
    pub stage: ErrorStage,
    pub kind: String,
    pub message: String,
    pub suggestion: String,
}

impl ErrorRecord {
    pub fn new(
        file: impl Into<String>,
        sheet: impl Into<String>,
        stage: ErrorStage,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let kind = kind.into();
        let message = message.into();
        let suggestion = crate::report::suggest_remedy(stage, &kind, &message);
        Self {
            file: file.into(),
            sheet: sheet.into(),
            stage,
            kind,
            message,
            suggestion,
        }
    }
}
