//! Ledger builder integration tests against a scratch SQLite database

use sqlx::Row;
use vap_common::config::PipelineConfig;
use vap_common::db::{init_database_pool, table_exists};
use vap_ingest::context::RunContext;
use vap_ingest::ledger::build_ledgers;
use vap_ingest::stage::{create_table, insert_rows, rows_from_sqlite};
use vap_ingest::types::{SheetRows, TableSchema, Value};

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn test_context(dir: &tempfile::TempDir) -> RunContext {
    let mut config = PipelineConfig::default();
    config.business.tag = "T".to_string();
    config.paths.database_dir = dir.path().join("db").display().to_string();
    config.paths.output_dir = dir.path().join("out").display().to_string();
    RunContext::from_config(&config)
}

fn staged_schema() -> TableSchema {
    TableSchema::new(vec![
        "发票代码".into(),
        "发票号码".into(),
        "开票日期".into(),
        "金额".into(),
        "开票年份".into(),
        "AUDIT_SRC_FILE".into(),
        "AUDIT_IMPORT_TIME".into(),
    ])
}

fn staged_row(code: &str, number: &str, date: &str, amount: &str, year: Value) -> Vec<Value> {
    vec![
        text(code),
        text(number),
        text(date),
        text(amount),
        year,
        text("a.xlsx"),
        text("2024-01-15 10:30:00"),
    ]
}

async fn stage_detail_rows(ctx: &RunContext, rows: Vec<Vec<Value>>) -> sqlx::SqlitePool {
    let pool = init_database_pool(&ctx.db_path).await.unwrap();
    let schema = staged_schema();
    create_table(&pool, &ctx.detail_table(), &schema).await.unwrap();
    let mut sheet = SheetRows::new(schema.columns.clone());
    sheet.rows = rows;
    let mut conn = pool.acquire().await.unwrap();
    insert_rows(&mut *conn, &ctx.detail_table(), &schema, &sheet)
        .await
        .unwrap();
    pool
}

async fn fetch_all(pool: &sqlx::SqlitePool, table: &str) -> SheetRows {
    let rows = sqlx::query(&format!("SELECT * FROM \"{}\" ORDER BY rowid", table))
        .fetch_all(pool)
        .await
        .unwrap();
    rows_from_sqlite(&rows)
}

#[tokio::test]
async fn dedup_keeps_first_occurrence_and_exports_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(&dir);
    let pool = stage_detail_rows(
        &ctx,
        vec![
            staged_row("A1", "001", "2021-01-01", "100", text("2021")),
            staged_row("A1", "002", "2021-02-01", "200", text("2021")),
            // Byte-identical duplicate of the first row
            staged_row("A1", "001", "2021-01-01", "100", text("2021")),
        ],
    )
    .await;

    let outcome = build_ledgers(&pool, &ctx).await;
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

    let partition = ctx.ledger_detail_table("2021");
    assert!(table_exists(&pool, &partition).await.unwrap());
    let rows = fetch_all(&pool, &partition).await;
    assert_eq!(rows.len(), 2);

    // Exactly one survivor for the duplicated key, and it is the first one
    let code_idx = rows.column_index("发票代码").unwrap();
    let number_idx = rows.column_index("发票号码").unwrap();
    let matching: Vec<_> = rows
        .rows
        .iter()
        .filter(|r| {
            r[code_idx] == text("A1") && r[number_idx] == text("001")
        })
        .collect();
    assert_eq!(matching.len(), 1);

    // The duplicate is preserved with a capture timestamp
    assert_eq!(outcome.duplicates_detail.len(), 1);
    let capture_idx = outcome
        .duplicates_detail
        .column_index("DEDUP_CAPTURE_TIME")
        .unwrap();
    assert_eq!(
        outcome.duplicates_detail.rows[0][capture_idx],
        text(&ctx.process_time)
    );

    let manifest = &outcome.manifest[0];
    assert_eq!(manifest.year, "2021");
    assert_eq!(manifest.rows_before, 3);
    assert_eq!(manifest.rows_after, 2);
    assert_eq!(manifest.rows_dropped, 1);
}

#[tokio::test]
async fn mixed_year_literals_build_one_partition() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(&dir);
    let pool = stage_detail_rows(
        &ctx,
        vec![
            // Same logical year in three literal shapes; the third row is a
            // cross-literal duplicate of the first
            staged_row("B1", "001", "2021-03-01", "50", text("2021")),
            staged_row("B2", "002", "2021-03-02", "60", text("2021.0")),
            staged_row("B1", "001", "2021-03-01", "50", Value::Number(2021.0)),
        ],
    )
    .await;

    let outcome = build_ledgers(&pool, &ctx).await;
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

    // One canonical partition, no 2021.0 variant
    assert_eq!(outcome.manifest.len(), 1);
    assert_eq!(outcome.manifest[0].year, "2021");
    assert!(table_exists(&pool, &ctx.ledger_detail_table("2021"))
        .await
        .unwrap());

    let rows = fetch_all(&pool, &ctx.ledger_detail_table("2021")).await;
    assert_eq!(rows.len(), 2);
    // The cross-literal duplicate was still detected
    assert_eq!(outcome.duplicates_detail.len(), 1);
}

#[tokio::test]
async fn rebuild_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(&dir);
    let pool = stage_detail_rows(
        &ctx,
        vec![
            staged_row("C1", "001", "2022-01-01", "10", text("2022")),
            staged_row("C2", "002", "2022-01-02", "20", text("2022")),
            staged_row("C1", "001", "2022-01-01", "10", text("2022")),
        ],
    )
    .await;

    let first = build_ledgers(&pool, &ctx).await;
    let partition = ctx.ledger_detail_table("2022");
    let rows_first = fetch_all(&pool, &partition).await;

    let second = build_ledgers(&pool, &ctx).await;
    let rows_second = fetch_all(&pool, &partition).await;

    assert_eq!(rows_first.columns, rows_second.columns);
    assert_eq!(rows_first.rows, rows_second.rows);
    assert_eq!(
        first.manifest[0].rows_after,
        second.manifest[0].rows_after
    );
}

#[tokio::test]
async fn header_partitions_use_identifier_key_only() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(&dir);
    let pool = init_database_pool(&ctx.db_path).await.unwrap();

    let schema = TableSchema::new(vec![
        "发票代码".into(),
        "发票号码".into(),
        "开票日期".into(),
        "开票年份".into(),
    ]);
    create_table(&pool, &ctx.header_table(), &schema).await.unwrap();
    let mut sheet = SheetRows::new(schema.columns.clone());
    // Same identifiers, different dates: still a duplicate for header rows
    sheet.rows.push(vec![
        text("H1"),
        text("001"),
        text("2021-01-01"),
        text("2021"),
    ]);
    sheet.rows.push(vec![
        text("H1"),
        text("001"),
        text("2021-06-01"),
        text("2021"),
    ]);
    let mut conn = pool.acquire().await.unwrap();
    insert_rows(&mut *conn, &ctx.header_table(), &schema, &sheet)
        .await
        .unwrap();
    drop(conn);

    let outcome = build_ledgers(&pool, &ctx).await;
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

    let rows = fetch_all(&pool, &ctx.ledger_header_table("2021")).await;
    assert_eq!(rows.len(), 1);
    let date_idx = rows.column_index("开票日期").unwrap();
    assert_eq!(rows.rows[0][date_idx], text("2021-01-01"));
    assert_eq!(outcome.duplicates_header.len(), 1);
}

#[tokio::test]
async fn partition_indexes_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(&dir);
    let pool = stage_detail_rows(
        &ctx,
        vec![staged_row("D1", "001", "2023-01-01", "10", text("2023"))],
    )
    .await;

    build_ledgers(&pool, &ctx).await;

    let indexes = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?",
    )
    .bind(ctx.ledger_detail_table("2023"))
    .fetch_all(&pool)
    .await
    .unwrap();
    let names: Vec<String> = indexes.iter().map(|r| r.get::<String, _>("name")).collect();
    assert!(names.iter().any(|n| n.ends_with("_code_no")), "{:?}", names);
}

#[tokio::test]
async fn no_staged_rows_creates_no_partition() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(&dir);
    let pool = init_database_pool(&ctx.db_path).await.unwrap();

    let outcome = build_ledgers(&pool, &ctx).await;
    assert!(outcome.manifest.is_empty());
    assert!(outcome.errors.is_empty());
    assert!(!table_exists(&pool, &ctx.ledger_detail_table("2021"))
        .await
        .unwrap());
}
