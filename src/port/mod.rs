//! Document Port: the engine's only view of a workbook
//!
//! The native automation channel drives one exclusive session per workbook. Bindings:
//! - [`MemoryPort`] - in-memory workbooks with fault injection, for tests and dry runs
//! - [`XlsxPort`] - .xlsx files on disk, edited in place with umya-spreadsheet
//!
//! Rows are 1-based physical row numbers, columns 0-based indexes.

mod memory;
mod workbook;
mod xlsx;

pub use memory::{Fault, MemoryPort};
pub use workbook::{SheetData, WorkbookData};
pub use xlsx::XlsxPort;

use crate::error::ScheduleResult;
use crate::types::{CellFormat, CellValue, RowSnapshot};
use std::fmt;
use std::path::Path;

/// Handle to an open workbook session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Where an inserted row takes its formatting from
#[derive(Debug, Clone, PartialEq)]
pub enum FormattingSource {
    None,
    /// Physical row in the same sheet, numbered as before the insert
    Row(u32),
    /// Per-column formats (column A first)
    Explicit(Vec<CellFormat>),
    /// Full cell styles of a row in the same sheet (numbered as before the insert), with
    /// `overrides` applied on top. Bindings that only know [`CellFormat`] use `overrides`.
    Inherit { row: u32, overrides: Vec<CellFormat> },
}

/// Operations the engine needs from a workbook automation channel.
///
/// Any failure surfaces as `ScheduleError::DocumentLock` or `ScheduleError::PartialWrite`
/// (plus `InvalidRow` for addressing mistakes made by the caller).
pub trait DocumentPort: Send + Sync {
    fn open(&self, path: &Path) -> ScheduleResult<SessionId>;

    fn sheet_names(&self, session: SessionId) -> ScheduleResult<Vec<String>>;

    fn row_count(&self, session: SessionId, sheet: &str) -> ScheduleResult<u32>;

    fn read_row(&self, session: SessionId, sheet: &str, row: u32) -> ScheduleResult<RowSnapshot>;

    /// Insert a row so that it becomes physical row `at` (1..=row_count+1), shifting the
    /// rows below it down and re-addressing formulas that point at them.
    ///
    /// `PartialWrite` means the row physically exists at `at` with only part of `values`
    /// in it; the caller owns removing it. A failure before the row exists must be
    /// reported as something else (`DocumentLock`, `InvalidRow`), never `PartialWrite`.
    fn insert_row(
        &self,
        session: SessionId,
        sheet: &str,
        at: u32,
        values: &[CellValue],
        formatting: &FormattingSource,
    ) -> ScheduleResult<()>;

    fn delete_row(&self, session: SessionId, sheet: &str, row: u32) -> ScheduleResult<()>;

    /// Overwrite single cells of an existing row, leaving their formatting alone
    fn write_cells(
        &self,
        session: SessionId,
        sheet: &str,
        row: u32,
        cells: &[(u16, CellValue)],
    ) -> ScheduleResult<()>;

    /// Append an empty sheet at the end of the workbook
    fn add_sheet(&self, session: SessionId, name: &str) -> ScheduleResult<()>;

    fn save(&self, session: SessionId) -> ScheduleResult<()>;

    /// Close without saving; unsaved mutations are discarded
    fn close(&self, session: SessionId) -> ScheduleResult<()>;
}
