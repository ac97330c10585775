//! Ingestion and end-to-end pipeline tests over in-memory workbook fixtures

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use vap_common::config::PipelineConfig;
use vap_common::db::{count_rows, init_database_pool, table_exists};
use vap_ingest::context::RunContext;
use vap_ingest::ingest::{run_parallel, run_sequential};
use vap_ingest::scan::scan_documents;
use vap_ingest::stage::rows_from_sqlite;
use vap_ingest::types::{SheetRows, Value};
use vap_ingest::workbook::fixture::{FixtureOpener, FixtureWorkbook};
use vap_ingest::Pipeline;

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Summary-classified invoice sheet ("信息汇总" routes to the DETAIL staging
/// table, which the detail ledger builds from).
fn invoice_sheet(rows: &[(&str, &str, &str, &str)]) -> SheetRows {
    let mut sheet = SheetRows::new(vec![
        "发票代码".into(),
        "发票号码".into(),
        "开票日期".into(),
        "金额".into(),
    ]);
    for (code, number, date, amount) in rows {
        sheet.rows.push(vec![
            text(code),
            text(number),
            text(date),
            text(amount),
        ]);
    }
    sheet
}

struct TestEnv {
    _dir: tempfile::TempDir,
    input_dir: PathBuf,
    config: PipelineConfig,
}

fn test_env(tag: &str) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("input");
    fs::create_dir_all(&input_dir).unwrap();

    let mut config = PipelineConfig::default();
    config.business.tag = tag.to_string();
    config.paths.input_dir = input_dir.display().to_string();
    config.paths.database_dir = dir.path().join("db").display().to_string();
    config.paths.output_dir = dir.path().join("out").display().to_string();
    config.import.workers = vap_common::config::WorkerCount::Fixed(2);

    TestEnv {
        _dir: dir,
        input_dir,
        config,
    }
}

fn stub_file(env: &TestEnv, name: &str) -> PathBuf {
    let path = env.input_dir.join(name);
    fs::write(&path, "stub").unwrap();
    path
}

#[tokio::test]
async fn partial_failure_isolated_to_one_sheet() {
    let env = test_env("T1");
    let path = stub_file(&env, "mixed.xlsx");

    let mut opener = FixtureOpener::new();
    opener.insert(
        &path,
        FixtureWorkbook::new(vec![
            (
                "发票信息汇总".into(),
                invoice_sheet(&[("A1", "001", "2021-01-01", "100")]),
            ),
            (
                "发票信息汇总2".into(),
                invoice_sheet(&[("A2", "002", "2021-02-01", "200")]),
            ),
        ])
        .with_failing_sheet("信息汇总坏", &["发票代码", "发票号码"]),
    );

    let ctx = RunContext::from_config(&env.config);
    let scan = scan_documents(&opener, &env.input_dir, ctx.max_file_mb);
    assert_eq!(scan.documents.len(), 1);

    let outcome = run_parallel(
        Arc::new(opener),
        &ctx,
        scan.documents.clone(),
        &scan.columns,
    )
    .await;

    // N-1 sheets succeed, exactly one manifest entry marks an error
    let ok_entries: Vec<_> = outcome
        .sheet_manifest
        .iter()
        .filter(|e| e.classification == "summary")
        .collect();
    let error_entries: Vec<_> = outcome
        .sheet_manifest
        .iter()
        .filter(|e| e.classification == "error")
        .collect();
    assert_eq!(ok_entries.len(), 2);
    assert_eq!(error_entries.len(), 1);
    assert_eq!(error_entries[0].sheet, "信息汇总坏");

    // No other sheet's rows were lost
    let total_rows: usize = outcome.shards.iter().map(|s| s.rows).sum();
    assert_eq!(total_rows, 2);
    // The file still counts as processed
    assert!(outcome.processed_files.contains("mixed.xlsx"));
    assert_eq!(outcome.errors.len(), 1);
}

#[tokio::test]
async fn corrupt_file_does_not_stop_others() {
    let env = test_env("T2");
    let good = stub_file(&env, "good.xlsx");
    let bad = stub_file(&env, "bad.xlsx");

    let mut opener = FixtureOpener::new();
    opener.insert(
        &good,
        FixtureWorkbook::new(vec![(
            "发票信息汇总".into(),
            invoice_sheet(&[("A1", "001", "2021-01-01", "100")]),
        )]),
    );
    opener.insert(&bad, FixtureWorkbook::corrupt());

    let ctx = RunContext::from_config(&env.config);
    let scan = scan_documents(&opener, &env.input_dir, ctx.max_file_mb);
    // The corrupt file already failed the metadata scan
    assert_eq!(scan.scan_failed, vec!["bad.xlsx".to_string()]);
    assert_eq!(scan.documents.len(), 1);

    let outcome = run_parallel(
        Arc::new(opener),
        &ctx,
        scan.documents.clone(),
        &scan.columns,
    )
    .await;
    assert!(outcome.processed_files.contains("good.xlsx"));
    assert_eq!(outcome.shards.len(), 1);
}

/// Forcing the streaming path must yield the same staged rows as batch mode.
#[tokio::test]
async fn streaming_and_batch_paths_are_equivalent() {
    let rows = &[
        ("A1", "001", "2021-01-01", "1,000"),
        ("A2", "002", "bad-date", "200"),
        ("A3", "003", "2021-03-01", "oops"),
        ("A4", "004", "2021-04-01", "400"),
        ("A5", "005", "2021-05-01", "500"),
    ];

    let mut staged: Vec<SheetRows> = Vec::new();
    for force_streaming in [false, true] {
        let env = test_env("EQ");
        let path = stub_file(&env, "book.xlsx");
        let mut config = env.config.clone();
        if force_streaming {
            // Any file size exceeds a zero threshold, so every file streams
            config.performance.memory_monitoring.large_file_streaming_mb = 0.0;
            config.import.stream_chunk_size = 2;
            config.performance.memory_monitoring.enabled = true;
        } else {
            config.performance.memory_monitoring.enabled = false;
        }

        let mut opener = FixtureOpener::new();
        opener.insert(
            &path,
            FixtureWorkbook::new(vec![("发票信息汇总".into(), invoice_sheet(rows))]),
        );

        let pipeline = Pipeline::new(RunContext::from_config(&config), Arc::new(opener));
        pipeline.run().await.unwrap();

        let ctx = RunContext::from_config(&config);
        let pool = init_database_pool(&ctx.db_path).await.unwrap();
        let fetched = sqlx::query(&format!(
            "SELECT * FROM \"{}\" ORDER BY rowid",
            ctx.detail_table()
        ))
        .fetch_all(&pool)
        .await
        .unwrap();
        staged.push(rows_from_sqlite(&fetched));
    }

    let (batch, streamed) = (&staged[0], &staged[1]);
    assert_eq!(batch.columns, streamed.columns);
    assert_eq!(batch.len(), 5);
    assert_eq!(batch.rows, streamed.rows);

    // Parse failures occupy the same null positions either way
    let date_idx = batch.column_index("开票日期").unwrap();
    let amount_idx = batch.column_index("金额").unwrap();
    assert_eq!(batch.rows[1][date_idx], Value::Null);
    assert_eq!(batch.rows[2][amount_idx], Value::Null);
}

#[tokio::test]
async fn sequential_mode_commits_per_file() {
    let env = test_env("SEQ");
    let good = stub_file(&env, "good.xlsx");
    let half = stub_file(&env, "half.xlsx");

    let mut opener = FixtureOpener::new();
    opener.insert(
        &good,
        FixtureWorkbook::new(vec![(
            "发票信息汇总".into(),
            invoice_sheet(&[("A1", "001", "2021-01-01", "100")]),
        )]),
    );
    // One good sheet and one poisoned sheet in the same file
    opener.insert(
        &half,
        FixtureWorkbook::new(vec![(
            "发票信息汇总".into(),
            invoice_sheet(&[("B1", "002", "2021-01-02", "50")]),
        )])
        .with_failing_sheet("信息汇总坏", &["发票代码", "发票号码"]),
    );

    let mut config = env.config.clone();
    config.import.parallel = false;
    let ctx = RunContext::from_config(&config);

    let scan = scan_documents(&opener, &env.input_dir, ctx.max_file_mb);
    let pool = init_database_pool(&ctx.db_path).await.unwrap();
    vap_ingest::stage::create_table(&pool, &ctx.detail_table(), &scan.columns.summary)
        .await
        .unwrap();

    let outcome = run_sequential(
        Arc::new(opener),
        &ctx,
        scan.documents.clone(),
        &scan.columns,
        &pool,
    )
    .await;

    // Both files land: the poisoned sheet was isolated, its file's good
    // sheet still committed
    assert_eq!(outcome.processed_files.len(), 2);
    assert_eq!(count_rows(&pool, &ctx.detail_table()).await.unwrap(), 2);
    assert_eq!(outcome.errors.len(), 1);
}

#[tokio::test]
async fn sequential_all_failing_file_contributes_nothing() {
    let env = test_env("SEQ2");
    let bad = stub_file(&env, "allbad.xlsx");

    let mut opener = FixtureOpener::new();
    opener.insert(
        &bad,
        FixtureWorkbook::new(vec![])
            .with_failing_sheet("发票信息汇总", &["发票代码", "发票号码", "金额"]),
    );

    let mut config = env.config.clone();
    config.import.parallel = false;
    let ctx = RunContext::from_config(&config);

    let scan = scan_documents(&opener, &env.input_dir, ctx.max_file_mb);
    let pool = init_database_pool(&ctx.db_path).await.unwrap();
    vap_ingest::stage::create_table(&pool, &ctx.detail_table(), &scan.columns.summary)
        .await
        .unwrap();

    let outcome = run_sequential(
        Arc::new(opener),
        &ctx,
        scan.documents.clone(),
        &scan.columns,
        &pool,
    )
    .await;

    assert!(outcome.processed_files.is_empty());
    assert_eq!(outcome.read_failed_files, vec!["allbad.xlsx".to_string()]);
    assert_eq!(count_rows(&pool, &ctx.detail_table()).await.unwrap(), 0);
}

/// Two documents carry the same invoice, one as a byte-identical duplicate.
/// After the full run the detail partition holds exactly one row for that
/// key and the duplicate export holds the other.
#[tokio::test]
async fn end_to_end_duplicate_invoice_scenario() {
    let env = test_env("E2E");
    let first = stub_file(&env, "first.xlsx");
    let second = stub_file(&env, "second.xlsx");

    let mut opener = FixtureOpener::new();
    opener.insert(
        &first,
        FixtureWorkbook::new(vec![(
            "发票信息汇总".into(),
            invoice_sheet(&[
                ("A1", "001", "2021-01-01", "100"),
                ("A9", "009", "2021-05-05", "900"),
            ]),
        )]),
    );
    opener.insert(
        &second,
        FixtureWorkbook::new(vec![(
            "发票信息汇总".into(),
            invoice_sheet(&[("A1", "001", "2021-01-01", "100")]),
        )]),
    );

    let ctx = RunContext::from_config(&env.config);
    let pipeline = Pipeline::new(RunContext::from_config(&env.config), Arc::new(opener));
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.summary.total_files, 2);
    assert_eq!(report.summary.processed_files, 2);

    let pool = init_database_pool(&ctx.db_path).await.unwrap();
    let partition = ctx.ledger_detail_table("2021");
    assert!(table_exists(&pool, &partition).await.unwrap());

    let fetched = sqlx::query(&format!("SELECT * FROM \"{}\"", partition))
        .fetch_all(&pool)
        .await
        .unwrap();
    let rows = rows_from_sqlite(&fetched);
    assert_eq!(rows.len(), 2);
    let code_idx = rows.column_index("发票代码").unwrap();
    let dup_key_rows = rows
        .rows
        .iter()
        .filter(|r| r[code_idx] == text("A1"))
        .count();
    assert_eq!(dup_key_rows, 1);

    // The transit table never survives the run
    assert!(!table_exists(&pool, &ctx.transit_table()).await.unwrap());

    // Duplicate export exists, carries a capture timestamp
    let out_dir = std::path::PathBuf::from(&env.config.paths.output_dir);
    let dup_export = fs::read_dir(&out_dir)
        .unwrap()
        .flatten()
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("duplicates_detail")
        })
        .expect("duplicate export present");
    let content = fs::read_to_string(dup_export.path()).unwrap();
    assert!(content.contains("DEDUP_CAPTURE_TIME"));
    assert!(content.lines().count() >= 2);

    // Summary and sheet manifest were exported too
    let names: Vec<String> = fs::read_dir(&out_dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(names.iter().any(|n| n.starts_with("ods_import_summary")));
    assert!(names.iter().any(|n| n.starts_with("ods_sheet_manifest")));
}
