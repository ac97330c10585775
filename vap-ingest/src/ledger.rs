//! Ledger builder: staged rows -> deduplicated year partitions
//!
//! For each invoice year present in the staged data, rows are fetched in
//! original insertion order, masked by a composite business key (first
//! occurrence wins), and the survivors fully replace the year partition.
//! Duplicates are never discarded: they receive a capture timestamp and
//! accumulate for a consolidated export.
//!
//! Year literals are normalized to the canonical 4-digit form before
//! grouping, so `2021` and `2021.0` land in the same partition and
//! cross-literal duplicates are still detected.

use crate::context::RunContext;
use crate::stage::{insert_rows, rows_from_sqlite, value_from_row};
use crate::types::{
    ErrorRecord, ErrorStage, SheetRows, TableSchema, Value, DEDUP_CAPTURE_TIME_COL,
    DETAIL_COLS_NEEDED, DETAIL_DEDUP_COLS, ETICKET_NUMBER_COL, HEADER_COLS_NEEDED,
    HEADER_DEDUP_COLS, INVOICE_CODE_COL, INVOICE_NUMBER_COL, INVOICE_YEAR_COL,
};
use sqlx::sqlite::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use vap_common::db::{quote_ident, table_exists};
use vap_common::Result;

/// Ledger type being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerType {
    Detail,
    Header,
}

impl LedgerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerType::Detail => "detail",
            LedgerType::Header => "header",
        }
    }

    fn dedup_cols(&self) -> &'static [&'static str] {
        match self {
            LedgerType::Detail => DETAIL_DEDUP_COLS,
            LedgerType::Header => HEADER_DEDUP_COLS,
        }
    }

    fn output_cols(&self) -> &'static [&'static str] {
        match self {
            LedgerType::Detail => DETAIL_COLS_NEEDED,
            LedgerType::Header => HEADER_COLS_NEEDED,
        }
    }
}

/// One manifest line per rebuilt partition
#[derive(Debug, Clone, serde::Serialize)]
pub struct LedgerManifestRow {
    #[serde(rename = "type")]
    pub ledger_type: String,
    pub year: String,
    pub rows_before: usize,
    pub rows_after: usize,
    pub rows_dropped: usize,
    pub cols: String,
}

/// Full ledger-build outcome
#[derive(Debug, Default)]
pub struct LedgerOutcome {
    pub manifest: Vec<LedgerManifestRow>,
    pub duplicates_detail: SheetRows,
    pub duplicates_header: SheetRows,
    pub errors: Vec<ErrorRecord>,
}

/// Normalize a raw year literal to its canonical 4-digit form.
///
/// Handles the mixed literal representations the staging data carries
/// (`"2021"`, `"2021.0"`, numeric 2021.0); anything that does not resolve
/// to a 4-digit year yields `None`.
pub fn normalize_invoice_year(raw: &Value) -> Option<String> {
    let s = raw.to_canonical_string();
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let normalized = if s.contains('.') {
        let f: f64 = s.parse().ok()?;
        format!("{}", f.trunc() as i64)
    } else {
        s.to_string()
    };
    (normalized.len() == 4 && normalized.chars().all(|c| c.is_ascii_digit()))
        .then_some(normalized)
}

/// Duplicate mask over rows already in insertion order: `true` marks a row
/// whose composite key was seen earlier. Falls back to the full row when
/// none of the key columns exist.
pub fn duplicate_mask(rows: &SheetRows, key_cols: &[&str]) -> Vec<bool> {
    let key_indices: Vec<usize> = key_cols
        .iter()
        .filter_map(|c| rows.column_index(c))
        .collect();
    let all_indices: Vec<usize> = (0..rows.columns.len()).collect();
    let indices: &[usize] = if key_indices.is_empty() {
        &all_indices
    } else {
        &key_indices
    };

    let mut seen = HashSet::with_capacity(rows.len());
    rows.rows
        .iter()
        .map(|row| {
            let key = indices
                .iter()
                .map(|&i| row.get(i).map(Value::to_canonical_string).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\u{1f}");
            !seen.insert(key)
        })
        .collect()
}

fn append_column(rows: &mut SheetRows, name: &str, value: Value) {
    if rows.column_index(name).is_none() {
        rows.columns.push(name.to_string());
        for row in rows.rows.iter_mut() {
            row.push(value.clone());
        }
    }
}

fn extend_duplicates(accumulator: &mut SheetRows, mut found: SheetRows) {
    if found.is_empty() {
        return;
    }
    if accumulator.columns.is_empty() {
        *accumulator = found;
        return;
    }
    let schema = TableSchema::new(accumulator.columns.clone());
    found = found.reindex(&schema);
    accumulator.rows.extend(found.rows);
}

/// Distinct raw year literals grouped by canonical year.
async fn year_groups(
    pool: &SqlitePool,
    staged_table: &str,
) -> Result<BTreeMap<String, Vec<Value>>> {
    let sql = format!(
        "SELECT DISTINCT {year} AS y FROM {table} WHERE {year} IS NOT NULL ORDER BY y",
        year = quote_ident(INVOICE_YEAR_COL),
        table = quote_ident(staged_table),
    );
    let raw_rows = sqlx::query(&sql).fetch_all(pool).await?;

    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in &raw_rows {
        let raw = value_from_row(row, 0);
        if let Some(year) = normalize_invoice_year(&raw) {
            groups.entry(year).or_default().push(raw);
        }
    }
    Ok(groups)
}

/// Fetch every staged row carrying any of the year's raw literals, in
/// original insertion order.
async fn fetch_year_rows(
    pool: &SqlitePool,
    staged_table: &str,
    literals: &[Value],
) -> Result<SheetRows> {
    let placeholders = vec!["?"; literals.len()].join(", ");
    let sql = format!(
        "SELECT * FROM {table} WHERE {year} IN ({placeholders}) ORDER BY rowid",
        table = quote_ident(staged_table),
        year = quote_ident(INVOICE_YEAR_COL),
    );
    let mut query = sqlx::query(&sql);
    for literal in literals {
        query = match literal {
            Value::Null => query.bind(None::<String>),
            Value::Text(s) => query.bind(s.clone()),
            Value::Number(n) => query.bind(*n),
        };
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows_from_sqlite(&rows))
}

/// Fully rebuild one year/type partition and return its manifest row.
async fn rebuild_partition(
    pool: &SqlitePool,
    ctx: &RunContext,
    ledger_type: LedgerType,
    year: &str,
    staged: SheetRows,
    duplicates_out: &mut SheetRows,
) -> Result<LedgerManifestRow> {
    let rows_before = staged.len();
    let mask = duplicate_mask(&staged, ledger_type.dedup_cols());

    let mut survivors = SheetRows::new(staged.columns.clone());
    let mut duplicates = SheetRows::new(staged.columns.clone());
    for (row, is_dup) in staged.rows.into_iter().zip(&mask) {
        if *is_dup {
            duplicates.rows.push(row);
        } else {
            survivors.rows.push(row);
        }
    }
    let rows_after = survivors.len();
    let rows_dropped = rows_before - rows_after;

    if !duplicates.is_empty() {
        append_column(
            &mut duplicates,
            DEDUP_CAPTURE_TIME_COL,
            Value::Text(ctx.process_time.clone()),
        );
        extend_duplicates(duplicates_out, duplicates);
    }

    // Output restricted to the defined column set, in its defined order;
    // staged data carrying none of it keeps its own columns
    let mut output_columns: Vec<String> = ledger_type
        .output_cols()
        .iter()
        .filter(|c| survivors.column_index(c).is_some())
        .map(|c| c.to_string())
        .collect();
    if output_columns.is_empty() {
        output_columns = survivors.columns.clone();
    }
    let schema = TableSchema::new(output_columns);
    let output = survivors.reindex(&schema);

    let table = match ledger_type {
        LedgerType::Detail => ctx.ledger_detail_table(year),
        LedgerType::Header => ctx.ledger_header_table(year),
    };

    // Full replace: never an incremental append onto a prior run
    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table)))
        .execute(&mut *tx)
        .await?;
    let ddl = format!(
        "CREATE TABLE {} ({})",
        quote_ident(&table),
        schema
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    sqlx::query(&ddl).execute(&mut *tx).await?;
    insert_rows(&mut *tx, &table, &schema, &output).await?;
    tx.commit().await?;

    ensure_partition_indexes(pool, &table, &schema).await?;

    tracing::info!(
        table = %table,
        rows_before,
        rows_after,
        rows_dropped,
        "Ledger partition rebuilt"
    );

    Ok(LedgerManifestRow {
        ledger_type: ledger_type.as_str().to_string(),
        year: year.to_string(),
        rows_before,
        rows_after,
        rows_dropped,
        cols: schema.columns.join(","),
    })
}

/// Two lookup indexes per partition: (code, number) and the e-ticket number.
async fn ensure_partition_indexes(
    pool: &SqlitePool,
    table: &str,
    schema: &TableSchema,
) -> Result<()> {
    let base = table.to_lowercase();
    if schema.contains(INVOICE_CODE_COL) && schema.contains(INVOICE_NUMBER_COL) {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({}, {})",
            quote_ident(&format!("idx_{}_code_no", base)),
            quote_ident(table),
            quote_ident(INVOICE_CODE_COL),
            quote_ident(INVOICE_NUMBER_COL),
        );
        sqlx::query(&sql).execute(pool).await?;
    }
    if schema.contains(ETICKET_NUMBER_COL) {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&format!("idx_{}_num", base)),
            quote_ident(table),
            quote_ident(ETICKET_NUMBER_COL),
        );
        sqlx::query(&sql).execute(pool).await?;
    }
    Ok(())
}

/// Build every year partition for one ledger type.
async fn build_type(
    pool: &SqlitePool,
    ctx: &RunContext,
    ledger_type: LedgerType,
    outcome: &mut LedgerOutcome,
) {
    let staged_table = match ledger_type {
        LedgerType::Detail => ctx.detail_table(),
        LedgerType::Header => ctx.header_table(),
    };

    match table_exists(pool, &staged_table).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(table = %staged_table, "No staged rows for ledger type");
            return;
        }
        Err(e) => {
            outcome.errors.push(ErrorRecord::new(
                "",
                "",
                ErrorStage::Transaction,
                "TableLookup",
                e.to_string(),
            ));
            return;
        }
    }

    let groups = match year_groups(pool, &staged_table).await {
        Ok(groups) => groups,
        Err(e) => {
            outcome.errors.push(ErrorRecord::new(
                "",
                "",
                ErrorStage::Transaction,
                "YearDiscovery",
                format!("{}: {}", staged_table, e),
            ));
            return;
        }
    };

    tracing::info!(
        table = %staged_table,
        years = groups.len(),
        ledger_type = ledger_type.as_str(),
        "Building year partitions"
    );

    for (year, literals) in groups {
        let staged = match fetch_year_rows(pool, &staged_table, &literals).await {
            Ok(rows) => rows,
            Err(e) => {
                outcome.errors.push(ErrorRecord::new(
                    "",
                    "",
                    ErrorStage::Transaction,
                    "FetchYear",
                    format!("{} year {}: {}", staged_table, year, e),
                ));
                continue;
            }
        };
        if staged.is_empty() {
            continue;
        }

        let duplicates_out = match ledger_type {
            LedgerType::Detail => &mut outcome.duplicates_detail,
            LedgerType::Header => &mut outcome.duplicates_header,
        };
        match rebuild_partition(pool, ctx, ledger_type, &year, staged, duplicates_out).await {
            Ok(manifest_row) => outcome.manifest.push(manifest_row),
            Err(e) => {
                // A failed year reruns from the staged source on the next run
                tracing::warn!(year = %year, error = %e, "Partition rebuild failed");
                outcome.errors.push(ErrorRecord::new(
                    "",
                    "",
                    ErrorStage::Transaction,
                    "RebuildPartition",
                    format!("{} year {}: {}", ledger_type.as_str(), year, e),
                ));
            }
        }
    }
}

/// Build all ledger partitions for both types.
pub async fn build_ledgers(pool: &SqlitePool, ctx: &RunContext) -> LedgerOutcome {
    let mut outcome = LedgerOutcome::default();
    build_type(pool, ctx, LedgerType::Detail, &mut outcome).await;
    build_type(pool, ctx, LedgerType::Header, &mut outcome).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_normalization() {
        assert_eq!(
            normalize_invoice_year(&Value::Text("2021".into())),
            Some("2021".into())
        );
        assert_eq!(
            normalize_invoice_year(&Value::Text("2021.0".into())),
            Some("2021".into())
        );
        assert_eq!(
            normalize_invoice_year(&Value::Number(2021.0)),
            Some("2021".into())
        );
        assert_eq!(normalize_invoice_year(&Value::Text("21".into())), None);
        assert_eq!(normalize_invoice_year(&Value::Text("abcd".into())), None);
        assert_eq!(normalize_invoice_year(&Value::Null), None);
    }

    fn key_rows(keys: &[(&str, &str)]) -> SheetRows {
        let mut rows = SheetRows::new(vec![
            INVOICE_CODE_COL.to_string(),
            INVOICE_NUMBER_COL.to_string(),
        ]);
        for (code, number) in keys {
            rows.rows.push(vec![
                Value::Text(code.to_string()),
                Value::Text(number.to_string()),
            ]);
        }
        rows
    }

    #[test]
    fn first_occurrence_wins() {
        let rows = key_rows(&[("A", "1"), ("A", "2"), ("A", "1"), ("A", "1")]);
        let mask = duplicate_mask(&rows, &[INVOICE_CODE_COL, INVOICE_NUMBER_COL]);
        assert_eq!(mask, vec![false, false, true, true]);
    }

    #[test]
    fn missing_key_columns_fall_back_to_full_row() {
        let mut rows = SheetRows::new(vec!["x".into()]);
        rows.rows.push(vec![Value::Text("same".into())]);
        rows.rows.push(vec![Value::Text("same".into())]);
        rows.rows.push(vec![Value::Text("other".into())]);
        let mask = duplicate_mask(&rows, DETAIL_DEDUP_COLS);
        assert_eq!(mask, vec![false, true, false]);
    }

    #[test]
    fn numeric_and_text_keys_compare_canonically() {
        let mut rows = SheetRows::new(vec![INVOICE_CODE_COL.to_string()]);
        rows.rows.push(vec![Value::Number(100.0)]);
        rows.rows.push(vec![Value::Text("100".into())]);
        let mask = duplicate_mask(&rows, &[INVOICE_CODE_COL]);
        assert_eq!(mask, vec![false, true]);
    }
}
