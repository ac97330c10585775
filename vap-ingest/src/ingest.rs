//! Ingestion coordinator
//!
//! Parallel mode fans one unit of work per source file out to a bounded
//! blocking-worker pool and collects results as they complete; workers never
//! touch the destination database, they only produce private shard files
//! (plus optional hand-offs to the spool consumer). Sequential mode performs
//! the same per-sheet logic synchronously, writing straight into the
//! destination inside one transaction per file; it offers strict per-file
//! atomicity where the parallel path offers throughput.
//!
//! Failure isolation is three-layered: a bad sheet is recorded and skipped,
//! a bad file aborts only that file's contribution, and nothing here ever
//! aborts the run.

use crate::context::RunContext;
use crate::handoff::{HandoffBatch, HandoffSender, SpoolConsumer};
use crate::normalize::{normalize_sheet, NormalizeOptions};
use crate::resource::{
    choose_worker_count, dynamic_stream_chunk_size, measure_disk_busy_percent, should_stream,
    MemorySample,
};
use crate::scan::{ClassColumns, SourceDocument};
use crate::shard::ShardWriter;
use crate::stage::insert_rows;
use crate::types::{
    CastFailure, CastStat, ErrorRecord, ErrorStage, SheetClass, SheetManifestEntry,
    ShardDescriptor, TableSchema,
};
use crate::workbook::{Workbook, WorkbookOpener};
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;
use vap_common::Result;

/// Combined result of the ingestion stage.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub sheet_manifest: Vec<SheetManifestEntry>,
    pub shards: Vec<ShardDescriptor>,
    pub processed_files: BTreeSet<String>,
    pub read_failed_files: Vec<String>,
    pub cast_stats: Vec<CastStat>,
    pub cast_failures: Vec<CastFailure>,
    pub errors: Vec<ErrorRecord>,
}

impl IngestOutcome {
    fn merge(&mut self, other: FileOutcome) {
        if other.file_ok {
            self.processed_files.insert(other.file_name.clone());
        } else {
            self.read_failed_files.push(other.file_name.clone());
        }
        self.sheet_manifest.extend(other.manifest);
        self.shards.extend(other.shards);
        self.cast_stats.extend(other.stats);
        self.cast_failures.extend(other.failures);
        self.errors.extend(other.errors);
    }
}

/// Private per-file accumulator returned by each worker; the coordinator
/// merges these after collection, so workers share no mutable state.
#[derive(Debug, Default)]
struct FileOutcome {
    file_name: String,
    file_ok: bool,
    manifest: Vec<SheetManifestEntry>,
    shards: Vec<ShardDescriptor>,
    stats: Vec<CastStat>,
    failures: Vec<CastFailure>,
    errors: Vec<ErrorRecord>,
}

/// Resolved destination for one classified sheet.
#[derive(Debug, Clone)]
struct SheetTarget {
    prefix: String,
    table: String,
    schema: TableSchema,
}

fn sheet_target(
    class: &SheetClass,
    ctx: &RunContext,
    columns: &ClassColumns,
) -> Option<SheetTarget> {
    match class {
        SheetClass::Special(suffix) => columns.special.get(suffix).map(|schema| SheetTarget {
            prefix: suffix.clone(),
            table: ctx.special_table(suffix),
            schema: schema.clone(),
        }),
        SheetClass::Summary => Some(SheetTarget {
            prefix: "DETAIL".to_string(),
            table: ctx.detail_table(),
            schema: columns.summary.clone(),
        }),
        SheetClass::Detail => Some(SheetTarget {
            prefix: "TEMP_TRANSIT".to_string(),
            table: ctx.transit_table(),
            schema: columns.detail.clone(),
        }),
        SheetClass::Header => Some(SheetTarget {
            prefix: "HEADER".to_string(),
            table: ctx.header_table(),
            schema: columns.header.clone(),
        }),
        SheetClass::Ignored => None,
    }
}

fn normalize_options(ctx: &RunContext) -> NormalizeOptions {
    NormalizeOptions {
        tax_text_to_zero: ctx.tax_text_to_zero,
        max_failure_samples: ctx.max_failure_samples,
        date_parse_success_ratio: ctx.date_parse_success_ratio,
    }
}

// ============================================================================
// Per-sheet processing (worker side)
// ============================================================================

/// Batch path: whole sheet in memory, one-shot shard write (or hand-off).
#[allow(clippy::too_many_arguments)]
fn batch_sheet_to_shard(
    workbook: &mut dyn Workbook,
    sheet_name: &str,
    target: &SheetTarget,
    temp_dir: &Path,
    file_name: &str,
    ctx: &RunContext,
    handoff: Option<&HandoffSender>,
    outcome: &mut FileOutcome,
) -> Result<usize> {
    let mut rows = workbook.read_sheet(sheet_name)?;
    let options = normalize_options(ctx);
    normalize_sheet(
        &mut rows,
        file_name,
        sheet_name,
        &ctx.process_time,
        &mut outcome.stats,
        &mut outcome.failures,
        &options,
    );
    let aligned = rows.reindex(&target.schema);
    let row_count = aligned.len();

    if let Some(sender) = handoff {
        let batch = HandoffBatch {
            target_table: target.table.clone(),
            prefix: target.prefix.clone(),
            source_file: file_name.to_string(),
            source_sheet: sheet_name.to_string(),
            schema: target.schema.clone(),
            rows: aligned,
        };
        match sender.offer(batch) {
            Ok(()) => return Ok(row_count),
            Err(returned) => {
                // Backpressure-to-disk fallback: spill to a private shard
                let descriptor = crate::shard::write_table(
                    temp_dir,
                    &target.prefix,
                    &target.table,
                    file_name,
                    sheet_name,
                    &target.schema,
                    &returned.rows,
                )?;
                outcome.shards.push(descriptor);
                return Ok(row_count);
            }
        }
    }

    let descriptor = crate::shard::write_table(
        temp_dir,
        &target.prefix,
        &target.table,
        file_name,
        sheet_name,
        &target.schema,
        &aligned,
    )?;
    outcome.shards.push(descriptor);
    Ok(row_count)
}

/// Streaming path: bounded chunks, incremental shard appends.
#[allow(clippy::too_many_arguments)]
fn stream_sheet_to_shard(
    workbook: &mut dyn Workbook,
    sheet_name: &str,
    target: &SheetTarget,
    temp_dir: &Path,
    file_name: &str,
    ctx: &RunContext,
    chunk_rows: usize,
    outcome: &mut FileOutcome,
) -> Result<usize> {
    let mut writer = ShardWriter::create(
        temp_dir,
        &target.prefix,
        &target.table,
        file_name,
        sheet_name,
        &target.schema,
    )?;
    let options = normalize_options(ctx);
    let stats = &mut outcome.stats;
    let failures = &mut outcome.failures;

    let result = workbook.read_sheet_chunks(sheet_name, chunk_rows, &mut |mut chunk| {
        normalize_sheet(
            &mut chunk,
            file_name,
            sheet_name,
            &ctx.process_time,
            stats,
            failures,
            &options,
        );
        writer.append_chunk(&chunk)?;
        Ok(())
    });

    match result {
        Ok(_) => {
            let rows = writer.rows_written();
            outcome.shards.push(writer.finish()?);
            Ok(rows)
        }
        Err(e) => {
            writer.abandon();
            Err(e)
        }
    }
}

/// Process every sheet of one source file. This is the unit of work the
/// parallel pool schedules; everything it touches is private to the worker.
fn process_file(
    opener: &dyn WorkbookOpener,
    ctx: &RunContext,
    document: &SourceDocument,
    columns: &ClassColumns,
    temp_root: &Path,
    use_streaming: bool,
    stream_chunk_rows: usize,
    handoff: Option<HandoffSender>,
) -> FileOutcome {
    let file_name = document.file_name.clone();
    let mut outcome = FileOutcome {
        file_name: file_name.clone(),
        ..Default::default()
    };
    let temp_dir = temp_root.join(format!("worker-{}", Uuid::new_v4().simple()));

    let mut workbook = match opener.open(&document.path) {
        Ok(wb) => wb,
        Err(e) => {
            tracing::warn!(file = %file_name, error = %e, "Workbook open failed");
            outcome.errors.push(ErrorRecord::new(
                &file_name,
                "",
                ErrorStage::OpenWorkbook,
                "OpenWorkbook",
                e.to_string(),
            ));
            return outcome;
        }
    };

    for (sheet_name, headers) in &document.sheets {
        let class = document.classification(sheet_name);
        let columns_joined = headers.join(";");

        let Some(target) = sheet_target(&class, ctx, columns) else {
            outcome.manifest.push(SheetManifestEntry {
                file: file_name.clone(),
                sheet: sheet_name.clone(),
                classification: class.label(),
                columns: columns_joined,
                target_table: String::new(),
                rows: None,
            });
            continue;
        };

        let result = if use_streaming {
            stream_sheet_to_shard(
                workbook.as_mut(),
                sheet_name,
                &target,
                &temp_dir,
                &file_name,
                ctx,
                stream_chunk_rows,
                &mut outcome,
            )
        } else {
            match batch_sheet_to_shard(
                workbook.as_mut(),
                sheet_name,
                &target,
                &temp_dir,
                &file_name,
                ctx,
                handoff.as_ref(),
                &mut outcome,
            ) {
                Ok(rows) => Ok(rows),
                Err(e) => {
                    // The only retry in the system: a failed batch read runs
                    // once more in streaming mode for this sheet
                    tracing::warn!(
                        file = %file_name,
                        sheet = %sheet_name,
                        error = %e,
                        "Batch read failed, retrying in streaming mode"
                    );
                    stream_sheet_to_shard(
                        workbook.as_mut(),
                        sheet_name,
                        &target,
                        &temp_dir,
                        &file_name,
                        ctx,
                        stream_chunk_rows,
                        &mut outcome,
                    )
                }
            }
        };

        match result {
            Ok(rows) => {
                outcome.file_ok = true;
                outcome.manifest.push(SheetManifestEntry {
                    file: file_name.clone(),
                    sheet: sheet_name.clone(),
                    classification: class.label(),
                    columns: columns_joined,
                    target_table: target.table,
                    rows: Some(rows),
                });
            }
            Err(e) => {
                tracing::warn!(file = %file_name, sheet = %sheet_name, error = %e, "Sheet failed");
                outcome.errors.push(ErrorRecord::new(
                    &file_name,
                    sheet_name,
                    ErrorStage::ReadSheet,
                    "ReadSheet",
                    e.to_string(),
                ));
                outcome.manifest.push(SheetManifestEntry {
                    file: file_name.clone(),
                    sheet: sheet_name.clone(),
                    classification: "error".to_string(),
                    columns: columns_joined,
                    target_table: target.table,
                    rows: None,
                });
            }
        }
    }

    outcome
}

// ============================================================================
// Parallel coordinator
// ============================================================================

/// Run the parallel import: one unit per file, results collected unordered.
pub async fn run_parallel(
    opener: Arc<dyn WorkbookOpener>,
    ctx: &RunContext,
    documents: Vec<SourceDocument>,
    columns: &ClassColumns,
) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();
    if documents.is_empty() {
        return outcome;
    }

    let disk_busy = if ctx.io_throttle_enabled {
        measure_disk_busy_percent(ctx.io_sample_ms)
    } else {
        None
    };
    if let Some(busy) = disk_busy {
        tracing::debug!(disk_busy_percent = format!("{:.1}", busy), "Disk sample");
    }
    let worker_count = choose_worker_count(
        documents.len(),
        &ctx.workers,
        disk_busy,
        ctx.io_busy_threshold_percent,
        ctx.io_reduce_factor,
        ctx.io_min_workers,
    );

    let stream_chunk_rows = if ctx.memory_monitoring_enabled {
        let memory = MemorySample::current();
        dynamic_stream_chunk_size(&memory, ctx.stream_chunk_memory_fraction)
    } else {
        ctx.stream_chunk_size
    };

    let temp_root = ctx.temp_root();
    tracing::info!(
        workers = worker_count,
        files = documents.len(),
        temp_root = %temp_root.display(),
        "Parallel import starting"
    );

    let spool = if ctx.handoff_enabled {
        Some(SpoolConsumer::start(
            temp_root.join("spool"),
            ctx.handoff_capacity,
            ctx.handoff_timeout_ms,
        ))
    } else {
        None
    };

    let total_sheets: usize = documents.iter().map(|d| d.sheets.len()).sum();
    let semaphore = Arc::new(Semaphore::new(worker_count));
    let mut join_set = JoinSet::new();
    let columns = Arc::new(columns.clone());

    for document in documents {
        let opener = Arc::clone(&opener);
        let ctx = ctx.clone();
        let columns = Arc::clone(&columns);
        let temp_root = temp_root.clone();
        let semaphore = Arc::clone(&semaphore);
        let handoff = spool.as_ref().map(|s| s.sender());

        join_set.spawn(async move {
            // Pool admission: at most `worker_count` blocking units in flight
            let _permit = semaphore.acquire_owned().await.ok();

            let use_streaming = if ctx.memory_monitoring_enabled {
                let size = document.path.metadata().map(|m| m.len()).unwrap_or(0);
                let memory = MemorySample::current();
                should_stream(
                    size,
                    ctx.large_file_streaming_mb,
                    ctx.stream_switch_threshold_percent,
                    ctx.available_memory_fraction,
                    &memory,
                )
            } else {
                false
            };

            tokio::task::spawn_blocking(move || {
                process_file(
                    opener.as_ref(),
                    &ctx,
                    &document,
                    &columns,
                    &temp_root,
                    use_streaming,
                    stream_chunk_rows,
                    handoff,
                )
            })
            .await
        });
    }

    // Collected as units complete; no cross-file ordering is promised
    let mut processed_sheets = 0usize;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(file_outcome)) => {
                for entry in &file_outcome.manifest {
                    processed_sheets += 1;
                    tracing::info!(
                        "[{}/{}] {} - {}: {} -> {} ({} rows)",
                        processed_sheets,
                        total_sheets,
                        entry.file,
                        entry.sheet,
                        entry.classification,
                        if entry.target_table.is_empty() {
                            "-"
                        } else {
                            &entry.target_table
                        },
                        entry.rows.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
                    );
                }
                outcome.merge(file_outcome);
            }
            Ok(Err(e)) => {
                outcome.errors.push(ErrorRecord::new(
                    "",
                    "",
                    ErrorStage::ReadSheet,
                    "WorkerPanic",
                    e.to_string(),
                ));
            }
            Err(e) => {
                outcome.errors.push(ErrorRecord::new(
                    "",
                    "",
                    ErrorStage::ReadSheet,
                    "WorkerJoin",
                    e.to_string(),
                ));
            }
        }
    }

    if let Some(spool) = spool {
        let (descriptors, errors) = spool.finish();
        outcome.shards.extend(descriptors);
        outcome.errors.extend(errors);
    }

    tracing::info!(
        files_ok = outcome.processed_files.len(),
        files_failed = outcome.read_failed_files.len(),
        shards = outcome.shards.len(),
        "Parallel import complete"
    );
    outcome
}

// ============================================================================
// Sequential mode
// ============================================================================

/// Sequential import: same per-sheet logic, direct database writes, one
/// transaction per file rolled back on any unhandled file error.
pub async fn run_sequential(
    opener: Arc<dyn WorkbookOpener>,
    ctx: &RunContext,
    documents: Vec<SourceDocument>,
    columns: &ClassColumns,
    pool: &SqlitePool,
) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();
    let options = normalize_options(ctx);

    for document in documents {
        let file_name = document.file_name.clone();
        let mut file_ok = false;
        let mut file_outcome = FileOutcome {
            file_name: file_name.clone(),
            ..Default::default()
        };

        let mut workbook = match opener.open(&document.path) {
            Ok(wb) => wb,
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Workbook open failed");
                file_outcome.errors.push(ErrorRecord::new(
                    &file_name,
                    "",
                    ErrorStage::OpenWorkbook,
                    "OpenWorkbook",
                    e.to_string(),
                ));
                outcome.merge(file_outcome);
                continue;
            }
        };

        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                file_outcome.errors.push(ErrorRecord::new(
                    &file_name,
                    "",
                    ErrorStage::Transaction,
                    "Begin",
                    e.to_string(),
                ));
                outcome.merge(file_outcome);
                continue;
            }
        };

        for (sheet_name, headers) in &document.sheets {
            let class = document.classification(sheet_name);
            let columns_joined = headers.join(";");

            let Some(target) = sheet_target(&class, ctx, columns) else {
                file_outcome.manifest.push(SheetManifestEntry {
                    file: file_name.clone(),
                    sheet: sheet_name.clone(),
                    classification: class.label(),
                    columns: columns_joined,
                    target_table: String::new(),
                    rows: None,
                });
                continue;
            };

            let sheet_result: Result<usize> = async {
                let mut rows = workbook.read_sheet(sheet_name)?;
                normalize_sheet(
                    &mut rows,
                    &file_name,
                    sheet_name,
                    &ctx.process_time,
                    &mut file_outcome.stats,
                    &mut file_outcome.failures,
                    &options,
                );
                let aligned = rows.reindex(&target.schema);
                insert_rows(&mut *tx, &target.table, &target.schema, &aligned).await
            }
            .await;

            match sheet_result {
                Ok(rows) => {
                    file_ok = true;
                    file_outcome.manifest.push(SheetManifestEntry {
                        file: file_name.clone(),
                        sheet: sheet_name.clone(),
                        classification: class.label(),
                        columns: columns_joined,
                        target_table: target.table,
                        rows: Some(rows),
                    });
                }
                Err(e) => {
                    tracing::warn!(file = %file_name, sheet = %sheet_name, error = %e, "Sheet failed");
                    file_outcome.errors.push(ErrorRecord::new(
                        &file_name,
                        sheet_name,
                        ErrorStage::ReadSheet,
                        "ReadSheet",
                        e.to_string(),
                    ));
                    file_outcome.manifest.push(SheetManifestEntry {
                        file: file_name.clone(),
                        sheet: sheet_name.clone(),
                        classification: "error".to_string(),
                        columns: columns_joined,
                        target_table: target.table,
                        rows: None,
                    });
                }
            }
        }

        // One transaction per file: commit only when at least one sheet
        // landed, otherwise the file contributes nothing
        if file_ok {
            if let Err(e) = tx.commit().await {
                file_ok = false;
                file_outcome.errors.push(ErrorRecord::new(
                    &file_name,
                    "",
                    ErrorStage::Transaction,
                    "Commit",
                    e.to_string(),
                ));
            }
        } else if let Err(e) = tx.rollback().await {
            file_outcome.errors.push(ErrorRecord::new(
                &file_name,
                "",
                ErrorStage::Transaction,
                "Rollback",
                e.to_string(),
            ));
        }

        file_outcome.file_ok = file_ok;
        outcome.merge(file_outcome);
    }

    outcome
}
