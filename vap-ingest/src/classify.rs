//! Sheet classification
//!
//! Pure, total, pattern-based: special-category patterns are tried first,
//! then summary, then header, then detail; anything unmatched is ignored.
//! Never errors, has no side effects.

use crate::types::{SheetClass, ETICKET_NUMBER_COL, INVOICE_CODE_COL, INVOICE_NUMBER_COL};
use once_cell::sync::Lazy;
use regex::Regex;

/// Category-specific sheet-name patterns, highest priority first.
static SPECIAL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"铁路(电子)?客票|铁路电子发票").unwrap(), "RAILWAY"),
        (Regex::new(r"建筑服务").unwrap(), "BUILDING_SERVICE"),
        (
            Regex::new(r"不动产租赁|不动产租赁经营服务").unwrap(),
            "REAL_ESTATE_RENTAL",
        ),
        (Regex::new(r"机动车销售统一发票").unwrap(), "VEHICLE"),
        (Regex::new(r"货物运输服务").unwrap(), "CARGO_TRANSPORT"),
        (Regex::new(r"过路过桥费").unwrap(), "TOLL"),
    ]
});

static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"信息汇总").unwrap());
static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"发票基础(?:信息|表)?\d*").unwrap());
static DETAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"明细").unwrap());

/// Header columns that identify a line-item (detail) sheet when the sheet
/// name alone does not match any pattern.
const DETAIL_MARKER_COL: &str = "货物或应税劳务名称";
/// Header columns that identify an invoice-header sheet in the same fallback.
const HEADER_MARKER_COL: &str = "销方名称";

/// Classify one sheet from its name and header columns.
///
/// Priority: special patterns, then summary, then header, then detail; a
/// header-column fallback applies only when no name pattern matched.
pub fn classify(sheet_name: &str, header_cols: &[String]) -> SheetClass {
    for (pattern, suffix) in SPECIAL_PATTERNS.iter() {
        if pattern.is_match(sheet_name) {
            return SheetClass::Special((*suffix).to_string());
        }
    }

    if SUMMARY_RE.is_match(sheet_name) {
        return SheetClass::Summary;
    }
    if HEADER_RE.is_match(sheet_name) {
        return SheetClass::Header;
    }
    if DETAIL_RE.is_match(sheet_name) {
        return SheetClass::Detail;
    }

    // Name matched nothing; fall back to the header shape. A sheet with the
    // invoice key columns plus a line-item name column is a detail dump, one
    // with the key columns plus counterparty names is a header sheet.
    let has = |name: &str| header_cols.iter().any(|c| c == name);
    let has_keys = (has(INVOICE_CODE_COL) && has(INVOICE_NUMBER_COL)) || has(ETICKET_NUMBER_COL);
    if has_keys && has(DETAIL_MARKER_COL) {
        return SheetClass::Detail;
    }
    if has_keys && has(HEADER_MARKER_COL) {
        return SheetClass::Header;
    }

    SheetClass::Ignored
}
