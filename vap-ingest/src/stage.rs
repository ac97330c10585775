//! Dynamic staging-table DDL and row transfer helpers
//!
//! Staging and ledger schemas are only known at run time (they are column
//! unions over scanned workbooks), so DDL and inserts are built dynamically.
//! Columns are declared without a type: SQLite then stores each bound value
//! with its own type, which keeps text and numeric cells intact through the
//! shard round-trip.

use crate::types::{SheetRows, TableSchema, Value};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, TypeInfo, ValueRef};
use vap_common::db::quote_ident;
use vap_common::Result;

/// Upper bound on bind parameters per INSERT statement.
const MAX_BIND_PARAMS: usize = 16_000;

/// Rows per INSERT statement for a given column count.
pub fn rows_per_insert(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).clamp(1, 500)
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Create a table if missing, with untyped columns from the schema.
pub async fn create_table(pool: &SqlitePool, table: &str, schema: &TableSchema) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        column_list(schema)
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Drop and recreate a table from the schema.
pub async fn recreate_table(pool: &SqlitePool, table: &str, schema: &TableSchema) -> Result<()> {
    drop_table(pool, table).await?;
    create_table(pool, table, schema).await
}

pub async fn drop_table(pool: &SqlitePool, table: &str) -> Result<()> {
    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Append rows to a table inside an open connection/transaction.
///
/// `rows` must already be aligned to `schema`; statements are sized to stay
/// under the bind-parameter limit.
pub async fn insert_rows(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
    rows: &SheetRows,
) -> Result<usize> {
    if rows.is_empty() || schema.columns.is_empty() {
        return Ok(0);
    }
    let prefix = format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        column_list(schema)
    );

    let mut written = 0usize;
    for batch in rows.rows.chunks(rows_per_insert(schema.columns.len())) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(&prefix);
        builder.push_values(batch, |mut b, row| {
            for i in 0..schema.columns.len() {
                match row.get(i).unwrap_or(&Value::Null) {
                    Value::Null => b.push_bind(None::<String>),
                    Value::Text(s) => b.push_bind(s.clone()),
                    Value::Number(n) => b.push_bind(*n),
                };
            }
        });
        builder.build().execute(&mut *conn).await?;
        written += batch.len();
    }
    Ok(written)
}

/// Decode one cell of a dynamically typed row.
pub fn value_from_row(row: &SqliteRow, idx: usize) -> Value {
    let Ok(raw) = row.try_get_raw(idx) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    match raw.type_info().name() {
        "INTEGER" => row
            .try_get::<i64, _>(idx)
            .map(|v| Value::Number(v as f64))
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<f64, _>(idx)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(idx)
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

/// Decode a full result set into column names plus value rows.
pub fn rows_from_sqlite(rows: &[SqliteRow]) -> SheetRows {
    let Some(first) = rows.first() else {
        return SheetRows::default();
    };
    use sqlx::Column;
    let columns: Vec<String> = first
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let mut out = SheetRows::new(columns);
    for row in rows {
        let values = (0..out.columns.len())
            .map(|i| value_from_row(row, i))
            .collect();
        out.rows.push(values);
    }
    out
}
