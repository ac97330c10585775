//! Workbook access behind a small trait seam
//!
//! Production reads go through calamine (`open_workbook_auto`, so `.xls` and
//! `.xlsx` both work). The trait exists so the ingestion coordinator can be
//! exercised against in-memory fixtures; see [`fixture`].

use crate::types::{SheetRows, Value};
use calamine::{open_workbook_auto, Data, Reader, Sheets};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use vap_common::{Error, Result};

/// One open workbook.
pub trait Workbook: Send {
    /// Sheet names in workbook order
    fn sheet_names(&mut self) -> Vec<String>;

    /// Header columns of one sheet (first row)
    fn sheet_header(&mut self, sheet: &str) -> Result<Vec<String>>;

    /// Whole-sheet batch read (header + all data rows)
    fn read_sheet(&mut self, sheet: &str) -> Result<SheetRows>;

    /// Bounded-chunk streaming read. The handler receives consecutive chunks
    /// sharing the sheet's header; returns the total data-row count.
    fn read_sheet_chunks(
        &mut self,
        sheet: &str,
        chunk_rows: usize,
        handler: &mut dyn FnMut(SheetRows) -> Result<()>,
    ) -> Result<usize>;
}

/// Opens workbooks by path.
pub trait WorkbookOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Workbook>>;
}

// ============================================================================
// Calamine implementation
// ============================================================================

/// Production opener backed by calamine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExcelOpener;

impl WorkbookOpener for ExcelOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Workbook>> {
        let sheets = open_workbook_auto(path)
            .map_err(|e| Error::Workbook(format!("open {}: {}", path.display(), e)))?;
        Ok(Box::new(ExcelWorkbook { sheets }))
    }
}

struct ExcelWorkbook {
    sheets: Sheets<BufReader<File>>,
}

impl ExcelWorkbook {
    fn range(&mut self, sheet: &str) -> Result<calamine::Range<Data>> {
        self.sheets
            .worksheet_range(sheet)
            .map_err(|e| Error::Workbook(format!("read sheet {}: {}", sheet, e)))
    }
}

/// Convert one spreadsheet cell to a pipeline value.
///
/// Native datetime cells surface as their raw serial number; the normalizer
/// owns epoch interpretation so both raw and typed sheets take the same path.
fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => {
            if s.trim().is_empty() {
                Value::Null
            } else {
                Value::Text(s.clone())
            }
        }
        Data::Float(f) => Value::Number(*f),
        Data::Int(i) => Value::Number(*i as f64),
        Data::Bool(b) => Value::Text(b.to_string()),
        Data::DateTime(dt) => Value::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::Text(s.clone()),
        Data::Error(_) => Value::Null,
    }
}

fn header_from_row(row: &[Data]) -> Vec<String> {
    row.iter()
        .enumerate()
        .map(|(i, cell)| {
            let name = cell_to_value(cell).to_canonical_string();
            let name = name.trim().to_string();
            if name.is_empty() {
                format!("Unnamed_{}", i)
            } else {
                name
            }
        })
        .collect()
}

impl Workbook for ExcelWorkbook {
    fn sheet_names(&mut self) -> Vec<String> {
        self.sheets.sheet_names().to_vec()
    }

    fn sheet_header(&mut self, sheet: &str) -> Result<Vec<String>> {
        let range = self.range(sheet)?;
        Ok(range.rows().next().map(header_from_row).unwrap_or_default())
    }

    fn read_sheet(&mut self, sheet: &str) -> Result<SheetRows> {
        let range = self.range(sheet)?;
        let mut rows = range.rows();
        let columns = rows.next().map(header_from_row).unwrap_or_default();
        let width = columns.len();

        let mut out = SheetRows::new(columns);
        for row in rows {
            let mut values: Vec<Value> = row.iter().map(cell_to_value).collect();
            values.resize(width, Value::Null);
            values.truncate(width);
            if SheetRows::row_is_blank(&values) {
                continue;
            }
            out.rows.push(values);
        }
        Ok(out)
    }

    fn read_sheet_chunks(
        &mut self,
        sheet: &str,
        chunk_rows: usize,
        handler: &mut dyn FnMut(SheetRows) -> Result<()>,
    ) -> Result<usize> {
        let range = self.range(sheet)?;
        let mut rows = range.rows();
        let columns = rows.next().map(header_from_row).unwrap_or_default();
        let width = columns.len();

        let mut total = 0usize;
        let mut chunk = SheetRows::new(columns.clone());
        for row in rows {
            let mut values: Vec<Value> = row.iter().map(cell_to_value).collect();
            values.resize(width, Value::Null);
            values.truncate(width);
            if SheetRows::row_is_blank(&values) {
                continue;
            }
            chunk.rows.push(values);

            if chunk.len() >= chunk_rows {
                total += chunk.len();
                handler(std::mem::replace(&mut chunk, SheetRows::new(columns.clone())))?;
            }
        }
        if !chunk.is_empty() {
            total += chunk.len();
            handler(chunk)?;
        }
        Ok(total)
    }
}

// ============================================================================
// In-memory fixtures for tests
// ============================================================================

/// In-memory workbook fixtures.
///
/// No crate in this workspace can author xlsx files, so ingestion tests
/// substitute this opener for [`ExcelOpener`]; failure injection covers the
/// corrupt-file and corrupt-sheet paths.
pub mod fixture {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    /// One fixture workbook: sheets plus injected failures.
    ///
    /// A failing sheet still exposes its header (the pre-scan sees it) but
    /// errors on any data read, matching a sheet that corrupts mid-file.
    #[derive(Debug, Clone, Default)]
    pub struct FixtureWorkbook {
        pub sheets: Vec<(String, SheetRows)>,
        /// Opening the workbook fails entirely
        pub fail_open: bool,
        /// Data reads of these sheets fail
        pub fail_sheets: HashSet<String>,
    }

    impl FixtureWorkbook {
        pub fn new(sheets: Vec<(String, SheetRows)>) -> Self {
            Self {
                sheets,
                ..Default::default()
            }
        }

        pub fn corrupt() -> Self {
            Self {
                fail_open: true,
                ..Default::default()
            }
        }

        /// Add a sheet whose header scans fine but whose rows cannot be read.
        pub fn with_failing_sheet(mut self, sheet: &str, columns: &[&str]) -> Self {
            self.sheets.push((
                sheet.to_string(),
                SheetRows::new(columns.iter().map(|s| s.to_string()).collect()),
            ));
            self.fail_sheets.insert(sheet.to_string());
            self
        }
    }

    /// Opener over a fixed path -> fixture map.
    #[derive(Debug, Clone, Default)]
    pub struct FixtureOpener {
        workbooks: HashMap<PathBuf, FixtureWorkbook>,
    }

    impl FixtureOpener {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, path: impl Into<PathBuf>, workbook: FixtureWorkbook) {
            self.workbooks.insert(path.into(), workbook);
        }
    }

    impl WorkbookOpener for FixtureOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn Workbook>> {
            let fixture = self
                .workbooks
                .get(path)
                .ok_or_else(|| Error::Workbook(format!("open {}: no such fixture", path.display())))?;
            if fixture.fail_open {
                return Err(Error::Workbook(format!(
                    "open {}: corrupt workbook",
                    path.display()
                )));
            }
            Ok(Box::new(OpenFixture {
                fixture: fixture.clone(),
            }))
        }
    }

    struct OpenFixture {
        fixture: FixtureWorkbook,
    }

    impl OpenFixture {
        fn lookup(&self, name: &str) -> Result<&SheetRows> {
            self.fixture
                .sheets
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, rows)| rows)
                .ok_or_else(|| Error::Workbook(format!("read sheet {}: not found", name)))
        }

        fn data(&self, name: &str) -> Result<&SheetRows> {
            if self.fixture.fail_sheets.contains(name) {
                return Err(Error::Workbook(format!("read sheet {}: corrupt sheet", name)));
            }
            self.lookup(name)
        }
    }

    impl Workbook for OpenFixture {
        fn sheet_names(&mut self) -> Vec<String> {
            self.fixture.sheets.iter().map(|(n, _)| n.clone()).collect()
        }

        fn sheet_header(&mut self, sheet: &str) -> Result<Vec<String>> {
            Ok(self.lookup(sheet)?.columns.clone())
        }

        fn read_sheet(&mut self, sheet: &str) -> Result<SheetRows> {
            Ok(self.data(sheet)?.clone())
        }

        fn read_sheet_chunks(
            &mut self,
            sheet: &str,
            chunk_rows: usize,
            handler: &mut dyn FnMut(SheetRows) -> Result<()>,
        ) -> Result<usize> {
            let rows = self.data(sheet)?.clone();
            let mut total = 0usize;
            for chunk_slice in rows.rows.chunks(chunk_rows.max(1)) {
                let chunk = SheetRows {
                    columns: rows.columns.clone(),
                    rows: chunk_slice.to_vec(),
                };
                total += chunk.len();
                handler(chunk)?;
            }
            Ok(total)
        }
    }
}
