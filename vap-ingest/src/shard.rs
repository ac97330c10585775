//! Staging shard files
//!
//! A shard is a temporary CSV interchange file produced by one worker for
//! one sheet, named `{PREFIX}__{file}__{sheet}__{uuid}.csv` so the merge
//! engine can route it by prefix alone. Shards are write-once and owned by
//! the worker that created them until the merge engine consumes the temp
//! tree and deletes it.

use crate::types::{SheetRows, ShardDescriptor, TableSchema, Value, SHARD_NAME_DELIMITER};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use vap_common::{Error, Result};
use walkdir::WalkDir;

fn csv_err(context: &str, e: csv::Error) -> Error {
    Error::Internal(format!("csv {}: {}", context, e))
}

/// Strip characters that would break the shard-name convention.
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            _ => c,
        })
        .collect::<String>()
        .replace(SHARD_NAME_DELIMITER, "-")
}

/// Shard file name for one (prefix, source file, sheet) triple.
pub fn shard_file_name(prefix: &str, source_file: &str, sheet: &str) -> String {
    format!(
        "{}{}{}{}{}{}{}.csv",
        prefix,
        SHARD_NAME_DELIMITER,
        sanitize_segment(source_file),
        SHARD_NAME_DELIMITER,
        sanitize_segment(sheet),
        SHARD_NAME_DELIMITER,
        Uuid::new_v4().simple()
    )
}

/// Destination prefix parsed back out of a shard file name.
pub fn shard_prefix(file_name: &str) -> Option<&str> {
    file_name
        .split_once(SHARD_NAME_DELIMITER)
        .map(|(prefix, _)| prefix)
}

/// Incremental shard writer; works for both one-shot and streaming sheets.
pub struct ShardWriter {
    writer: csv::Writer<fs::File>,
    path: PathBuf,
    target_table: String,
    source_file: String,
    source_sheet: String,
    schema: TableSchema,
    rows: usize,
}

impl ShardWriter {
    /// Create the shard file and write its header row.
    pub fn create(
        dir: &Path,
        prefix: &str,
        target_table: &str,
        source_file: &str,
        source_sheet: &str,
        schema: &TableSchema,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(shard_file_name(prefix, source_file, source_sheet));
        let file = fs::File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(&schema.columns)
            .map_err(|e| csv_err("write header", e))?;
        Ok(Self {
            writer,
            path,
            target_table: target_table.to_string(),
            source_file: source_file.to_string(),
            source_sheet: source_sheet.to_string(),
            schema: schema.clone(),
            rows: 0,
        })
    }

    /// Append one normalized chunk; rows are reindexed to the shard schema.
    pub fn append_chunk(&mut self, chunk: &SheetRows) -> Result<usize> {
        let aligned = chunk.reindex(&self.schema);
        for row in &aligned.rows {
            let record: Vec<String> = row.iter().map(Value::to_canonical_string).collect();
            self.writer
                .write_record(&record)
                .map_err(|e| csv_err("write row", e))?;
        }
        self.rows += aligned.rows.len();
        Ok(aligned.rows.len())
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// Flush and seal the shard, producing its descriptor.
    pub fn finish(mut self) -> Result<ShardDescriptor> {
        self.writer
            .flush()
            .map_err(|e| Error::Internal(format!("csv flush: {}", e)))?;
        Ok(ShardDescriptor {
            path: self.path,
            target_table: self.target_table,
            source_file: self.source_file,
            source_sheet: self.source_sheet,
            rows: self.rows,
        })
    }

    /// Abandon the shard, removing the partial file (best effort).
    pub fn abandon(self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// One-shot shard write of a fully materialized table slice.
pub fn write_table(
    dir: &Path,
    prefix: &str,
    target_table: &str,
    source_file: &str,
    source_sheet: &str,
    schema: &TableSchema,
    rows: &SheetRows,
) -> Result<ShardDescriptor> {
    let mut writer = ShardWriter::create(dir, prefix, target_table, source_file, source_sheet, schema)?;
    writer.append_chunk(rows)?;
    writer.finish()
}

// ============================================================================
// Shard reading (merge side)
// ============================================================================

/// All shard CSV files under the temp root, recursively.
pub fn discover_shards(temp_root: &Path) -> Vec<PathBuf> {
    let mut shards = Vec::new();
    for entry in WalkDir::new(temp_root).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        {
            shards.push(entry.path().to_path_buf());
        }
    }
    shards.sort();
    shards
}

/// Header columns of a shard file.
pub fn read_shard_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| csv_err("open shard", e))?;
    let header = reader
        .headers()
        .map_err(|e| csv_err("read shard header", e))?;
    Ok(header.iter().map(|s| s.to_string()).collect())
}

/// Pull-style bounded chunk reader over one shard file. Empty fields become
/// nulls; all other fields stay textual, exactly as written.
pub struct ShardChunkReader {
    reader: csv::Reader<fs::File>,
    columns: Vec<String>,
    chunk_rows: usize,
}

impl ShardChunkReader {
    pub fn open(path: &Path, chunk_rows: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| csv_err("open shard", e))?;
        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| csv_err("read shard header", e))?
            .iter()
            .map(|s| s.to_string())
            .collect();
        Ok(Self {
            reader,
            columns,
            chunk_rows: chunk_rows.max(1),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Next bounded chunk, `None` at end of shard.
    pub fn next_chunk(&mut self) -> Result<Option<SheetRows>> {
        let width = self.columns.len();
        let mut chunk = SheetRows::new(self.columns.clone());
        for record in self.reader.records() {
            let record = record.map_err(|e| csv_err("read shard row", e))?;
            let mut row: Vec<Value> = record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Value::Null
                    } else {
                        Value::Text(field.to_string())
                    }
                })
                .collect();
            row.resize(width, Value::Null);
            chunk.rows.push(row);
            if chunk.len() >= self.chunk_rows {
                return Ok(Some(chunk));
            }
        }
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}

/// Callback variant of [`ShardChunkReader`] for synchronous consumers.
pub fn read_shard_chunks(
    path: &Path,
    chunk_rows: usize,
    handler: &mut dyn FnMut(SheetRows) -> Result<()>,
) -> Result<usize> {
    let mut reader = ShardChunkReader::open(path, chunk_rows)?;
    let mut total = 0usize;
    while let Some(chunk) = reader.next_chunk()? {
        total += chunk.len();
        handler(chunk)?;
    }
    Ok(total)
}

// ============================================================================
// Temp tree management
// ============================================================================

/// Remove one run's temp tree (after a successful or abandoned merge).
pub fn cleanup_temp_root(temp_root: &Path) {
    if temp_root.exists() {
        if let Err(e) = fs::remove_dir_all(temp_root) {
            tracing::warn!(path = %temp_root.display(), error = %e, "Temp cleanup failed");
        }
    }
}

/// Remove stale temp trees left behind by earlier, crashed runs.
pub fn cleanup_old_temp_trees(parent: &Path, current: &Path) {
    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path != current {
            tracing::info!(path = %path.display(), "Removing stale temp tree");
            let _ = fs::remove_dir_all(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec!["发票代码".into(), "金额".into()])
    }

    fn rows() -> SheetRows {
        let mut rows = SheetRows::new(vec!["发票代码".into(), "金额".into()]);
        rows.rows
            .push(vec![Value::Text("A1".into()), Value::Number(100.0)]);
        rows.rows.push(vec![Value::Text("A2".into()), Value::Null]);
        rows
    }

    #[test]
    fn shard_name_round_trips_prefix() {
        let name = shard_file_name("HEADER", "进项 2021.xlsx", "发票基础信息");
        assert_eq!(shard_prefix(&name), Some("HEADER"));
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn delimiter_in_source_names_is_sanitized() {
        let name = shard_file_name("DETAIL", "weird__file.xlsx", "s");
        // The prefix is still the first segment
        assert_eq!(shard_prefix(&name), Some("DETAIL"));
        let segments: Vec<&str> = name.split(SHARD_NAME_DELIMITER).collect();
        assert_eq!(segments.len(), 4);
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_table(
            dir.path(),
            "TEMP_TRANSIT",
            "ODS_T_TEMP_TRANSIT",
            "a.xlsx",
            "明细",
            &schema(),
            &rows(),
        )
        .unwrap();
        assert_eq!(descriptor.rows, 2);
        assert_eq!(descriptor.target_table, "ODS_T_TEMP_TRANSIT");

        assert_eq!(
            read_shard_header(&descriptor.path).unwrap(),
            vec!["发票代码", "金额"]
        );

        let mut all = Vec::new();
        let total = read_shard_chunks(&descriptor.path, 1, &mut |chunk| {
            all.extend(chunk.rows);
            Ok(())
        })
        .unwrap();
        assert_eq!(total, 2);
        assert_eq!(all[0][0], Value::Text("A1".into()));
        assert_eq!(all[0][1], Value::Text("100".into()));
        assert_eq!(all[1][1], Value::Null);
    }

    #[test]
    fn streaming_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShardWriter::create(
            dir.path(),
            "HEADER",
            "ODS_T_HEADER",
            "a.xlsx",
            "基础信息",
            &schema(),
        )
        .unwrap();
        writer.append_chunk(&rows()).unwrap();
        writer.append_chunk(&rows()).unwrap();
        let descriptor = writer.finish().unwrap();
        assert_eq!(descriptor.rows, 4);
    }

    #[test]
    fn discover_finds_only_csv() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("worker-1");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("x__a__b__c.csv"), "h\n1\n").unwrap();
        fs::write(sub.join("notes.txt"), "ignored").unwrap();

        let shards = discover_shards(dir.path());
        assert_eq!(shards.len(), 1);
    }

    #[test]
    fn stale_trees_removed_current_kept() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("2024-01-01_00-00-00");
        let current = dir.path().join("2024-06-01_12-00-00");
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&current).unwrap();

        cleanup_old_temp_trees(dir.path(), &current);
        assert!(!old.exists());
        assert!(current.exists());
    }
}
