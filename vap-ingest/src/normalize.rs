//! Per-column value normalization with conversion statistics
//!
//! Dates are tried with a generic parse, two spreadsheet epoch conventions,
//! then a final string parse; the first method clearing its success-ratio
//! threshold wins. Numeric columns lose thousands separators and percent
//! signs. The tax-rate column is special-cased: recognized exemption tokens
//! map to a sentinel and a derived numeric column is always produced next to
//! the original text.
//!
//! A bad cell never aborts a batch: it degrades to null plus a bounded
//! failure sample.

use crate::types::{
    CastFailure, CastStat, SheetRows, Value, AUDIT_IMPORT_TIME_COL, AUDIT_SRC_FILE_COL, DATE_COLS,
    INVOICE_CODE_COL, INVOICE_DATE_COL, INVOICE_NUMBER_COL, INVOICE_YEAR_COL, NUMERIC_COLS,
    TAX_RATE_COL, TAX_RATE_NUMERIC_COL,
};
use chrono::{Duration, NaiveDate};

/// Exemption markers accepted in the tax-rate column
const TAX_TEXT_TOKENS: &[&str] = &["免税", "不征税", "免征"];

/// Spreadsheet serial-date epochs, in trial order
const EPOCH_1900: (i32, u32, u32) = (1899, 12, 30);
const EPOCH_1904: (i32, u32, u32) = (1904, 1, 1);

/// Success ratio the 1900-epoch interpretation must clear
const EPOCH_SUCCESS_RATIO: f64 = 0.5;

/// Normalization knobs carried from the run context
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub tax_text_to_zero: bool,
    pub max_failure_samples: usize,
    pub date_parse_success_ratio: f64,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            tax_text_to_zero: true,
            max_failure_samples: 100,
            date_parse_success_ratio: 0.7,
        }
    }
}

// ============================================================================
// Date parsing
// ============================================================================

/// Parse one textual date cell. Accepts the formats the source workbooks
/// actually contain; a trailing time-of-day component is ignored.
fn parse_date_text(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let date_part = s.split_whitespace().next().unwrap_or(s);

    for format in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y年%m月%d日"] {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, format) {
            return Some(d);
        }
    }
    // Compact form 20210131
    if date_part.len() == 8 && date_part.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, "%Y%m%d") {
            return Some(d);
        }
    }
    None
}

/// Interpret a numeric cell as a serial day offset from a spreadsheet epoch.
fn serial_to_date(serial: f64, epoch: (i32, u32, u32)) -> Option<NaiveDate> {
    if !serial.is_finite() || serial <= 0.0 || serial > 200_000.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(epoch.0, epoch.1, epoch.2)?;
    base.checked_add_signed(Duration::days(serial.trunc() as i64))
}

fn format_date(d: NaiveDate) -> Value {
    Value::Text(d.format("%Y-%m-%d").to_string())
}

/// True when every non-null cell in the column is numeric.
fn column_is_numeric(values: &[Value]) -> bool {
    let mut seen = false;
    for v in values {
        match v {
            Value::Number(_) => seen = true,
            Value::Null => {}
            Value::Text(s) if s.trim().is_empty() => {}
            Value::Text(_) => return false,
        }
    }
    seen
}

/// Normalize a date column.
///
/// Returns the parsed values, the winning method name, and the
/// converted/failed counts. Unparsed cells become null.
pub fn normalize_date_column(
    values: &[Value],
    success_ratio: f64,
) -> (Vec<Value>, &'static str, usize, usize) {
    let total = values.len();

    // Method 1: generic parse of textual cells
    let generic: Vec<Option<NaiveDate>> = values
        .iter()
        .map(|v| v.as_text().and_then(parse_date_text))
        .collect();
    let converted = generic.iter().filter(|d| d.is_some()).count();
    if (converted as f64) >= success_ratio * (total as f64) {
        let out = generic
            .into_iter()
            .map(|d| d.map(format_date).unwrap_or(Value::Null))
            .collect();
        return (out, "generic_parse", converted, total - converted);
    }

    // Methods 2/3: serial-number interpretations for numeric columns
    if column_is_numeric(values) {
        let epoch_1900: Vec<Option<NaiveDate>> = values
            .iter()
            .map(|v| v.as_number().and_then(|n| serial_to_date(n, EPOCH_1900)))
            .collect();
        let converted = epoch_1900.iter().filter(|d| d.is_some()).count();
        if (converted as f64) >= EPOCH_SUCCESS_RATIO * (total as f64) && converted > 0 {
            let out = epoch_1900
                .into_iter()
                .map(|d| d.map(format_date).unwrap_or(Value::Null))
                .collect();
            return (out, "excel_1899-12-30", converted, total - converted);
        }

        let epoch_1904: Vec<Option<NaiveDate>> = values
            .iter()
            .map(|v| v.as_number().and_then(|n| serial_to_date(n, EPOCH_1904)))
            .collect();
        let converted = epoch_1904.iter().filter(|d| d.is_some()).count();
        if converted > 0 {
            let out = epoch_1904
                .into_iter()
                .map(|d| d.map(format_date).unwrap_or(Value::Null))
                .collect();
            return (out, "excel_1904-01-01", converted, total - converted);
        }
    }

    // Method 4: final string parse over the canonical rendering
    let parsed: Vec<Option<NaiveDate>> = values
        .iter()
        .map(|v| match v {
            Value::Null => None,
            other => parse_date_text(&other.to_canonical_string()),
        })
        .collect();
    let converted = parsed.iter().filter(|d| d.is_some()).count();
    let out = parsed
        .into_iter()
        .map(|d| d.map(format_date).unwrap_or(Value::Null))
        .collect();
    (out, "final_str_parse", converted, total - converted)
}

// ============================================================================
// Numeric parsing
// ============================================================================

/// Strip thousands separators and percent signs, then parse.
fn parse_numeric_text(s: &str) -> Option<f64> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '，' && *c != '%' && *c != '％')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Normalize a plain numeric column. Returns (values, converted, failed);
/// `failed` counts non-blank cells that did not parse.
pub fn normalize_numeric_column(values: &[Value]) -> (Vec<Value>, usize, usize) {
    let mut converted = 0;
    let mut failed = 0;
    let out = values
        .iter()
        .map(|v| match v {
            Value::Null => Value::Null,
            Value::Number(n) => {
                converted += 1;
                Value::Number(*n)
            }
            Value::Text(s) => {
                if s.trim().is_empty() {
                    return Value::Null;
                }
                match parse_numeric_text(s) {
                    Some(n) => {
                        converted += 1;
                        Value::Number(n)
                    }
                    None => {
                        failed += 1;
                        Value::Null
                    }
                }
            }
        })
        .collect();
    (out, converted, failed)
}

/// Tax-rate parse result: numeric values, counts, and the text-token mask.
pub struct TaxRateParse {
    pub numeric: Vec<Value>,
    pub converted: usize,
    pub failed: usize,
    pub text_count: usize,
    pub text_mask: Vec<bool>,
}

/// Parse the tax-rate column, recognizing textual exemption tokens.
///
/// Token cells are not parse failures; they are counted separately and the
/// caller decides whether they map to zero.
pub fn normalize_tax_rate_column(values: &[Value]) -> TaxRateParse {
    let mut numeric = Vec::with_capacity(values.len());
    let mut text_mask = Vec::with_capacity(values.len());
    let mut converted = 0;
    let mut failed = 0;
    let mut text_count = 0;

    for v in values {
        let is_token = v
            .as_text()
            .map(|s| TAX_TEXT_TOKENS.contains(&s.trim()))
            .unwrap_or(false);
        text_mask.push(is_token);
        if is_token {
            text_count += 1;
            numeric.push(Value::Null);
            continue;
        }
        match v {
            Value::Null => numeric.push(Value::Null),
            Value::Number(n) => {
                converted += 1;
                numeric.push(Value::Number(*n));
            }
            Value::Text(s) => {
                if s.trim().is_empty() {
                    numeric.push(Value::Null);
                } else {
                    match parse_numeric_text(s) {
                        Some(n) => {
                            converted += 1;
                            numeric.push(Value::Number(n));
                        }
                        None => {
                            failed += 1;
                            numeric.push(Value::Null);
                        }
                    }
                }
            }
        }
    }

    TaxRateParse {
        numeric,
        converted,
        failed,
        text_count,
        text_mask,
    }
}

// ============================================================================
// Sheet-level normalization
// ============================================================================

fn column_values(sheet: &SheetRows, idx: usize) -> Vec<Value> {
    sheet
        .rows
        .iter()
        .map(|row| row.get(idx).cloned().unwrap_or(Value::Null))
        .collect()
}

fn set_column(sheet: &mut SheetRows, idx: usize, values: Vec<Value>) {
    for (row, value) in sheet.rows.iter_mut().zip(values) {
        if idx < row.len() {
            row[idx] = value;
        }
    }
}

/// Append a new column, or overwrite it if the name already exists.
fn upsert_column(sheet: &mut SheetRows, name: &str, values: Vec<Value>) {
    match sheet.column_index(name) {
        Some(idx) => set_column(sheet, idx, values),
        None => {
            sheet.columns.push(name.to_string());
            for (row, value) in sheet.rows.iter_mut().zip(values) {
                row.push(value);
            }
        }
    }
}

/// Normalize the recognized columns of one sheet in place, recording
/// conversion statistics and bounded failure samples.
pub fn cast_and_record(
    sheet: &mut SheetRows,
    file_name: &str,
    sheet_name: &str,
    stats: &mut Vec<CastStat>,
    failures: &mut Vec<CastFailure>,
    options: &NormalizeOptions,
) {
    let total = sheet.len();

    for &column in DATE_COLS {
        let Some(idx) = sheet.column_index(column) else {
            continue;
        };
        let original = column_values(sheet, idx);
        let (parsed, method, converted, failed) =
            normalize_date_column(&original, options.date_parse_success_ratio);

        // Sample cells that had content but did not parse, bounded per column
        let code_idx = sheet.column_index(INVOICE_CODE_COL);
        let number_idx = sheet.column_index(INVOICE_NUMBER_COL);
        let mut sampled = 0;
        for (row_index, (orig, new)) in original.iter().zip(&parsed).enumerate() {
            if sampled >= options.max_failure_samples {
                break;
            }
            let had_content = match orig {
                Value::Null => false,
                Value::Text(s) => !s.trim().is_empty(),
                Value::Number(_) => true,
            };
            if had_content && new.is_null() {
                failures.push(CastFailure {
                    file: file_name.to_string(),
                    sheet: sheet_name.to_string(),
                    column: column.to_string(),
                    row_index,
                    orig_value: orig.to_canonical_string(),
                    invoice_code: code_idx
                        .and_then(|i| sheet.rows[row_index].get(i))
                        .map(Value::to_canonical_string)
                        .filter(|s| !s.is_empty()),
                    invoice_number: number_idx
                        .and_then(|i| sheet.rows[row_index].get(i))
                        .map(Value::to_canonical_string)
                        .filter(|s| !s.is_empty()),
                });
                sampled += 1;
            }
        }

        set_column(sheet, idx, parsed);
        stats.push(CastStat {
            file: file_name.to_string(),
            sheet: sheet_name.to_string(),
            column: column.to_string(),
            method: method.to_string(),
            total,
            converted,
            failed,
        });
    }

    for &column in NUMERIC_COLS {
        let Some(idx) = sheet.column_index(column) else {
            continue;
        };

        if column == TAX_RATE_COL {
            let original = column_values(sheet, idx);
            let mut parse = normalize_tax_rate_column(&original);

            if options.tax_text_to_zero && parse.text_count > 0 {
                for (value, is_token) in parse.numeric.iter_mut().zip(&parse.text_mask) {
                    if *is_token {
                        *value = Value::Number(0.0);
                    }
                }
                stats.push(CastStat {
                    file: file_name.to_string(),
                    sheet: sheet_name.to_string(),
                    column: TAX_RATE_NUMERIC_COL.to_string(),
                    method: "map_tax_text_to_zero".to_string(),
                    total,
                    converted: parse.text_count,
                    failed: 0,
                });
            }

            stats.push(CastStat {
                file: file_name.to_string(),
                sheet: sheet_name.to_string(),
                column: TAX_RATE_NUMERIC_COL.to_string(),
                method: "tax_parse".to_string(),
                total,
                converted: parse.converted,
                failed: parse.failed,
            });
            if parse.text_count > 0 {
                stats.push(CastStat {
                    file: file_name.to_string(),
                    sheet: sheet_name.to_string(),
                    column: TAX_RATE_COL.to_string(),
                    method: "tax_text_tokens".to_string(),
                    total,
                    converted: parse.text_count,
                    failed: 0,
                });
            }

            // The original text stays in place; the numeric companion is
            // always produced alongside it.
            upsert_column(sheet, TAX_RATE_NUMERIC_COL, parse.numeric);
        } else {
            let original = column_values(sheet, idx);
            let (parsed, converted, failed) = normalize_numeric_column(&original);
            set_column(sheet, idx, parsed);
            stats.push(CastStat {
                file: file_name.to_string(),
                sheet: sheet_name.to_string(),
                column: column.to_string(),
                method: "numeric_parse".to_string(),
                total,
                converted,
                failed,
            });
        }
    }
}

/// Append/overwrite the audit columns on every row.
pub fn add_audit_columns(sheet: &mut SheetRows, file_name: &str, process_time: &str) {
    let n = sheet.len();
    upsert_column(
        sheet,
        AUDIT_SRC_FILE_COL,
        vec![Value::Text(file_name.to_string()); n],
    );
    upsert_column(
        sheet,
        AUDIT_IMPORT_TIME_COL,
        vec![Value::Text(process_time.to_string()); n],
    );
}

/// Derive the invoice-year column from the date column (first four
/// characters), null when the date is null or the column is absent.
pub fn add_invoice_year_column(sheet: &mut SheetRows) {
    let n = sheet.len();
    let years = match sheet.column_index(INVOICE_DATE_COL) {
        Some(idx) => sheet
            .rows
            .iter()
            .map(|row| match row.get(idx).unwrap_or(&Value::Null) {
                Value::Null => Value::Null,
                other => {
                    let s = other.to_canonical_string();
                    let year: String = s.chars().take(4).collect();
                    if year.is_empty() {
                        Value::Null
                    } else {
                        Value::Text(year)
                    }
                }
            })
            .collect(),
        None => vec![Value::Null; n],
    };
    upsert_column(sheet, INVOICE_YEAR_COL, years);
}

/// Full normalization pass for one sheet: cast columns, stamp audit columns,
/// derive the invoice year, and drop fully blank rows.
pub fn normalize_sheet(
    sheet: &mut SheetRows,
    file_name: &str,
    sheet_name: &str,
    process_time: &str,
    stats: &mut Vec<CastStat>,
    failures: &mut Vec<CastFailure>,
    options: &NormalizeOptions,
) -> usize {
    sheet.rows.retain(|row| !SheetRows::row_is_blank(row));
    cast_and_record(sheet, file_name, sheet_name, stats, failures, options);
    add_audit_columns(sheet, file_name, process_time);
    add_invoice_year_column(sheet);
    sheet.len()
}
