//! End-to-end run orchestration
//!
//! Scan -> stage preparation -> ingest (parallel or sequential) -> merge ->
//! exports -> ledger build -> cleanup. The run always completes and emits a
//! summary plus an error log; only setup failures (directories, database)
//! abort.

use crate::context::RunContext;
use crate::ingest::{run_parallel, run_sequential, IngestOutcome};
use crate::ledger::build_ledgers;
use crate::merge::{merge_shards, DestinationSchemas};
use crate::report;
use crate::scan::{scan_documents, ScanOutcome};
use crate::shard::{cleanup_old_temp_trees, cleanup_temp_root};
use crate::stage::{drop_table, recreate_table};
use crate::types::{ErrorRecord, RunSummary, TEMP_DIR_PREFIX};
use crate::workbook::WorkbookOpener;
use anyhow::{Context as _, Result};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use vap_common::db::init_database_pool;

/// One pipeline invocation against one destination database.
pub struct Pipeline {
    ctx: RunContext,
    opener: Arc<dyn WorkbookOpener>,
}

/// What a completed run produced, beyond its database writes.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub errors: Vec<ErrorRecord>,
}

impl Pipeline {
    pub fn new(ctx: RunContext, opener: Arc<dyn WorkbookOpener>) -> Self {
        Self { ctx, opener }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Execute the full run.
    pub async fn run(&self) -> Result<RunReport> {
        let ctx = &self.ctx;
        tracing::info!(
            business_tag = %ctx.business_tag,
            input_dir = %ctx.input_dir.display(),
            process_time = %ctx.process_time,
            "Pipeline starting"
        );

        // Unrecoverable setup: working directories and the destination DB
        std::fs::create_dir_all(&ctx.database_dir)
            .with_context(|| format!("create database dir {}", ctx.database_dir.display()))?;
        std::fs::create_dir_all(&ctx.output_dir)
            .with_context(|| format!("create output dir {}", ctx.output_dir.display()))?;
        let pool = init_database_pool(&ctx.db_path)
            .await
            .with_context(|| format!("open database {}", ctx.db_path.display()))?;
        tracing::info!(db = %ctx.db_path.display(), "Database ready (WAL)");

        // Pre-scan
        let scan = scan_documents(self.opener.as_ref(), &ctx.input_dir, ctx.max_file_mb);
        let mut errors: Vec<ErrorRecord> = scan.errors.clone();

        if scan.documents.is_empty() {
            tracing::warn!("No ingestible workbooks found");
            let summary = self.build_summary(&scan, &IngestOutcome::default());
            self.export_tail(&summary, &IngestOutcome::default(), &errors);
            return Ok(RunReport { summary, errors });
        }

        // Staging tables are rebuilt from this run's column unions
        let schemas = self.prepare_staging(&pool, &scan).await?;

        // Ingest
        let outcome = if ctx.parallel {
            let temp_root = ctx.temp_root();
            cleanup_old_temp_trees(&ctx.output_dir.join(TEMP_DIR_PREFIX), &temp_root);

            let outcome = run_parallel(
                Arc::clone(&self.opener),
                ctx,
                scan.documents.clone(),
                &scan.columns,
            )
            .await;

            let merge_errors = merge_shards(&pool, &temp_root, ctx, &schemas).await;
            errors.extend(merge_errors);
            cleanup_temp_root(&temp_root);
            outcome
        } else {
            tracing::info!("Sequential import (direct database writes)");
            run_sequential(
                Arc::clone(&self.opener),
                ctx,
                scan.documents.clone(),
                &scan.columns,
                &pool,
            )
            .await
        };
        errors.extend(outcome.errors.clone());

        let summary = self.build_summary(&scan, &outcome);
        tracing::info!(
            total = summary.total_files,
            processed = summary.processed_files,
            scan_failed = scan.scan_failed.len(),
            read_failed = outcome.read_failed_files.len(),
            "Import summary"
        );

        // Ledger build + duplicate export
        let ledger = build_ledgers(&pool, ctx).await;
        errors.extend(ledger.errors.clone());

        let stamp = ctx.process_time_stamp();
        if let Err(e) = report::export_ledger_manifest(&ctx.output_dir, &stamp, &ledger.manifest) {
            tracing::warn!(error = %e, "Ledger manifest export failed");
        }
        for (prefix, duplicates) in [
            (report::DUPLICATES_DETAIL_PREFIX, &ledger.duplicates_detail),
            (report::DUPLICATES_HEADER_PREFIX, &ledger.duplicates_header),
        ] {
            match report::export_duplicates(
                &ctx.output_dir,
                &stamp,
                prefix,
                duplicates,
                &ctx.process_time,
            ) {
                Ok(Some(path)) => {
                    tracing::info!(path = %path.display(), "Duplicates exported");
                }
                Ok(None) => tracing::info!(export = prefix, "No duplicates found"),
                Err(e) => tracing::warn!(error = %e, "Duplicate export failed"),
            }
        }

        self.export_tail(&summary, &outcome, &errors);

        // The transit table only carries raw in-run rows; drop it at the end
        if let Err(e) = drop_table(&pool, &ctx.transit_table()).await {
            tracing::warn!(error = %e, "Transit table cleanup failed");
        }

        tracing::info!("Pipeline complete");
        Ok(RunReport { summary, errors })
    }

    /// Recreate the staging tables from the scanned column unions and return
    /// the destination schema map for the merge engine.
    async fn prepare_staging(
        &self,
        pool: &SqlitePool,
        scan: &ScanOutcome,
    ) -> Result<DestinationSchemas> {
        let ctx = &self.ctx;
        let mut schemas = DestinationSchemas::new();
        schemas.insert(ctx.transit_table(), scan.columns.detail.clone());
        schemas.insert(ctx.detail_table(), scan.columns.summary.clone());
        schemas.insert(ctx.header_table(), scan.columns.header.clone());
        for (suffix, schema) in &scan.columns.special {
            schemas.insert(ctx.special_table(suffix), schema.clone());
        }

        for (table, schema) in &schemas {
            if schema.columns.is_empty() {
                continue;
            }
            recreate_table(pool, table, schema)
                .await
                .with_context(|| format!("prepare staging table {}", table))?;
        }
        Ok(schemas)
    }

    fn build_summary(&self, scan: &ScanOutcome, outcome: &IngestOutcome) -> RunSummary {
        RunSummary {
            total_files: scan.documents.len() + scan.scan_failed.len(),
            processed_files: outcome.processed_files.len(),
            scan_failed_files: scan.scan_failed.join(";"),
            read_failed_files: outcome.read_failed_files.join(";"),
            process_time: self.ctx.process_time.clone(),
        }
    }

    /// Best-effort export block shared by the empty-run and full-run paths.
    fn export_tail(&self, summary: &RunSummary, outcome: &IngestOutcome, errors: &[ErrorRecord]) {
        let ctx = &self.ctx;
        let stamp = ctx.process_time_stamp();

        if let Err(e) = report::export_sheet_manifest(&ctx.output_dir, &stamp, &outcome.sheet_manifest)
        {
            tracing::warn!(error = %e, "Sheet manifest export failed");
        }
        if outcome.cast_stats.is_empty() {
            tracing::info!("No type conversions recorded");
        } else if let Err(e) =
            report::export_cast_stats(&ctx.output_dir, &stamp, &outcome.cast_stats)
        {
            tracing::warn!(error = %e, "Cast stats export failed");
        }
        if !outcome.cast_failures.is_empty() {
            if let Err(e) = report::export_cast_failures(
                &ctx.output_dir,
                &stamp,
                &outcome.cast_failures,
                ctx.max_failure_samples,
            ) {
                tracing::warn!(error = %e, "Cast failure export failed");
            }
        }
        if let Err(e) = report::export_summary(&ctx.output_dir, &stamp, summary) {
            tracing::warn!(error = %e, "Summary export failed");
        }
        if !errors.is_empty() {
            if let Err(e) = report::export_error_logs(&ctx.output_dir, &stamp, errors) {
                tracing::warn!(error = %e, "Error log export failed");
            }
        }
    }
}
