//! Merge engine: shard files -> staging tables
//!
//! Runs strictly single-threaded in the coordinating process (the
//! destination database is a single-writer resource). Failure policy is
//! two-tier: a chunk-level write failure is logged and skipped while the
//! rest of the group still commits; a failure to open the group transaction
//! abandons that destination table's merge for the run.

use crate::context::RunContext;
use crate::shard::{discover_shards, read_shard_header, shard_prefix, ShardChunkReader};
use crate::stage::insert_rows;
use crate::types::{ErrorRecord, ErrorStage, TableSchema};
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Destination schemas known to this run, keyed by table name.
pub type DestinationSchemas = BTreeMap<String, TableSchema>;

/// Resolve the destination table for one shard file.
///
/// Filename-prefix convention first, then column overlap against the known
/// destination schemas; anything unresolvable defaults to the transit table.
pub fn assign_target_table(
    shard: &Path,
    ctx: &RunContext,
    schemas: &DestinationSchemas,
) -> String {
    let file_name = shard
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if let Some(prefix) = shard_prefix(&file_name) {
        match prefix {
            "TEMP_TRANSIT" | "TEMP" => return ctx.transit_table(),
            "HEADER" => return ctx.header_table(),
            "DETAIL" => return ctx.detail_table(),
            other => {
                let suffix = format!("_{}", other.to_uppercase());
                if let Some(table) = schemas
                    .keys()
                    .find(|t| t.to_uppercase().ends_with(&suffix))
                {
                    return table.clone();
                }
            }
        }
    }

    // Fallback: route by column overlap with a known destination
    if let Ok(columns) = read_shard_header(shard) {
        for (table, schema) in schemas {
            if columns.iter().any(|c| schema.contains(c)) {
                return table.clone();
            }
        }
    }

    ctx.transit_table()
}

/// Merge every shard under the temp root into its staging table.
///
/// Returns the errors recovered along the way; the merge itself never
/// fails the run.
pub async fn merge_shards(
    pool: &SqlitePool,
    temp_root: &Path,
    ctx: &RunContext,
    schemas: &DestinationSchemas,
) -> Vec<ErrorRecord> {
    let mut errors = Vec::new();

    let shards = discover_shards(temp_root);
    if shards.is_empty() {
        tracing::info!("No shards to merge");
        return errors;
    }

    let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for shard in shards {
        let table = assign_target_table(&shard, ctx, schemas);
        grouped.entry(table).or_default().push(shard);
    }

    tracing::info!(
        tables = grouped.len(),
        "Merging shards into staging tables"
    );

    for (table, shard_paths) in grouped {
        let schema = match schemas.get(&table) {
            Some(s) => s.clone(),
            None => {
                // Shards routed to an unknown table can still carry rows;
                // adopt the first shard's own header as the schema
                match shard_paths.first().map(|p| read_shard_header(p)) {
                    Some(Ok(columns)) => TableSchema::new(columns),
                    _ => {
                        errors.push(ErrorRecord::new(
                            "",
                            "",
                            ErrorStage::MergeGroup,
                            "UnknownSchema",
                            format!("no schema for destination {}", table),
                        ));
                        continue;
                    }
                }
            }
        };

        if let Err(e) = crate::stage::create_table(pool, &table, &schema).await {
            errors.push(ErrorRecord::new(
                "",
                "",
                ErrorStage::MergeGroup,
                "CreateTable",
                format!("{}: {}", table, e),
            ));
            continue;
        }

        // Group transaction: open failure abandons the whole destination
        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Merge group transaction failed to open");
                errors.push(ErrorRecord::new(
                    "",
                    "",
                    ErrorStage::MergeGroup,
                    "Transaction",
                    format!("{}: {}", table, e),
                ));
                continue;
            }
        };

        let mut merged_rows = 0usize;
        for shard in &shard_paths {
            let shard_name = shard
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let mut reader = match ShardChunkReader::open(shard, ctx.csv_chunk_size) {
                Ok(r) => r,
                Err(e) => {
                    errors.push(ErrorRecord::new(
                        &shard_name,
                        "",
                        ErrorStage::MergeChunk,
                        "ReadShard",
                        e.to_string(),
                    ));
                    continue;
                }
            };

            let mut chunk_no = 0usize;
            loop {
                let chunk = match reader.next_chunk() {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        errors.push(ErrorRecord::new(
                            &shard_name,
                            "",
                            ErrorStage::MergeChunk,
                            "ReadShard",
                            format!("chunk {}: {}", chunk_no, e),
                        ));
                        break;
                    }
                };
                let aligned = chunk.reindex(&schema);
                match insert_rows(&mut *tx, &table, &schema, &aligned).await {
                    Ok(n) => merged_rows += n,
                    Err(e) => {
                        // Chunk skipped; the rest of the group still lands
                        tracing::warn!(
                            shard = %shard_name,
                            table = %table,
                            chunk = chunk_no,
                            error = %e,
                            "Merge chunk failed, skipping"
                        );
                        errors.push(ErrorRecord::new(
                            &shard_name,
                            "",
                            ErrorStage::MergeChunk,
                            "Insert",
                            format!("chunk {}: {}", chunk_no, e),
                        ));
                    }
                }
                chunk_no += 1;
            }
        }

        match tx.commit().await {
            Ok(()) => {
                tracing::info!(table = %table, shards = shard_paths.len(), rows = merged_rows, "Merge group committed");
            }
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Merge group commit failed");
                errors.push(ErrorRecord::new(
                    "",
                    "",
                    ErrorStage::MergeGroup,
                    "Commit",
                    format!("{}: {}", table, e),
                ));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::write_table;
    use crate::types::{SheetRows, Value};
    use vap_common::config::PipelineConfig;
    use vap_common::db::{count_rows, init_database_pool};

    fn ctx() -> RunContext {
        let mut config = PipelineConfig::default();
        config.business.tag = "T".to_string();
        RunContext::from_config(&config)
    }

    fn schemas(ctx: &RunContext) -> DestinationSchemas {
        let mut m = DestinationSchemas::new();
        m.insert(
            ctx.transit_table(),
            TableSchema::new(vec!["发票代码".into(), "金额".into()]),
        );
        m.insert(
            ctx.header_table(),
            TableSchema::new(vec!["发票代码".into(), "销方名称".into()]),
        );
        m.insert(
            ctx.special_table("RAILWAY"),
            TableSchema::new(vec!["乘车人".into()]),
        );
        m
    }

    fn rows(columns: &[&str], data: &[&[&str]]) -> SheetRows {
        let mut sheet = SheetRows::new(columns.iter().map(|s| s.to_string()).collect());
        for row in data {
            sheet
                .rows
                .push(row.iter().map(|v| Value::Text(v.to_string())).collect());
        }
        sheet
    }

    #[test]
    fn prefix_assignment() {
        let ctx = ctx();
        let schemas = schemas(&ctx);
        let dir = tempfile::tempdir().unwrap();
        let schema = TableSchema::new(vec!["发票代码".into()]);
        let transit = write_table(
            dir.path(),
            "TEMP_TRANSIT",
            "x",
            "a.xlsx",
            "s",
            &schema,
            &rows(&["发票代码"], &[&["A"]]),
        )
        .unwrap();
        assert_eq!(
            assign_target_table(&transit.path, &ctx, &schemas),
            "ODS_T_TEMP_TRANSIT"
        );

        let special = write_table(
            dir.path(),
            "RAILWAY",
            "x",
            "a.xlsx",
            "s",
            &schema,
            &rows(&["发票代码"], &[&["A"]]),
        )
        .unwrap();
        assert_eq!(
            assign_target_table(&special.path, &ctx, &schemas),
            "ODS_T_SPECIAL_RAILWAY"
        );
    }

    #[test]
    fn column_overlap_fallback_and_transit_default() {
        let ctx = ctx();
        let schemas = schemas(&ctx);
        let dir = tempfile::tempdir().unwrap();

        // Unknown prefix, header overlapping the header table schema
        let by_overlap = write_table(
            dir.path(),
            "WHATEVER",
            "x",
            "a.xlsx",
            "s",
            &TableSchema::new(vec!["销方名称".into()]),
            &rows(&["销方名称"], &[&["卖家"]]),
        )
        .unwrap();
        assert_eq!(
            assign_target_table(&by_overlap.path, &ctx, &schemas),
            "ODS_T_HEADER"
        );

        // Unknown prefix, no overlap at all
        let orphan = write_table(
            dir.path(),
            "WHATEVER",
            "x",
            "a.xlsx",
            "s",
            &TableSchema::new(vec!["陌生列".into()]),
            &rows(&["陌生列"], &[&["?"]]),
        )
        .unwrap();
        assert_eq!(
            assign_target_table(&orphan.path, &ctx, &schemas),
            "ODS_T_TEMP_TRANSIT"
        );
    }

    #[tokio::test]
    async fn merge_appends_rows_per_group() {
        let ctx = ctx();
        let schemas = schemas(&ctx);
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let pool = init_database_pool(&db_dir.path().join("t.db"))
            .await
            .unwrap();

        write_table(
            dir.path(),
            "HEADER",
            "x",
            "a.xlsx",
            "s1",
            &TableSchema::new(vec!["发票代码".into(), "销方名称".into()]),
            &rows(&["发票代码", "销方名称"], &[&["A1", "卖家"], &["A2", "卖家"]]),
        )
        .unwrap();
        write_table(
            dir.path(),
            "HEADER",
            "x",
            "b.xlsx",
            "s1",
            &TableSchema::new(vec!["发票代码".into(), "销方名称".into()]),
            &rows(&["发票代码", "销方名称"], &[&["B1", "卖家"]]),
        )
        .unwrap();

        let errors = merge_shards(&pool, dir.path(), &ctx, &schemas).await;
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(count_rows(&pool, "ODS_T_HEADER").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_shard_does_not_block_group() {
        let ctx = ctx();
        let schemas = schemas(&ctx);
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let pool = init_database_pool(&db_dir.path().join("t.db"))
            .await
            .unwrap();

        write_table(
            dir.path(),
            "HEADER",
            "x",
            "good.xlsx",
            "s1",
            &TableSchema::new(vec!["发票代码".into(), "销方名称".into()]),
            &rows(&["发票代码", "销方名称"], &[&["A1", "卖家"]]),
        )
        .unwrap();
        // A header-only file routed to the same group; no rows, no harm
        std::fs::write(dir.path().join("HEADER__bad__s__0.csv"), "发票代码,销方名称\n").unwrap();

        let errors = merge_shards(&pool, dir.path(), &ctx, &schemas).await;
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(count_rows(&pool, "ODS_T_HEADER").await.unwrap(), 1);
    }
}
