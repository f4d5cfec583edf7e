//! In-memory workbook content shared by the port bindings

use crate::error::{ScheduleError, ScheduleResult};
use crate::formula;
use crate::types::{Cell, CellFormat, CellValue, RowSnapshot};

use super::FormattingSource;

/// One sheet: rows in physical order, row 1 at index 0
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SheetData {
    pub name: String,
    pub rows: Vec<RowSnapshot>,
}

impl SheetData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn read(&self, row: u32) -> ScheduleResult<RowSnapshot> {
        self.check_existing(row)?;
        Ok(self.rows[(row - 1) as usize].clone())
    }

    /// Insert a row so that it becomes physical row `at` (1..=row_count+1).
    ///
    /// `FormattingSource::Row` is resolved against the numbering *before* the insert.
    pub fn insert(
        &mut self,
        at: u32,
        values: &[CellValue],
        formatting: &FormattingSource,
    ) -> ScheduleResult<()> {
        if at == 0 || at > self.row_count() + 1 {
            return Err(ScheduleError::invalid_row(
                &self.name,
                at,
                format!("insert position outside 1..={}", self.row_count() + 1),
            ));
        }
        let formats = self.resolve_formats(formatting)?;
        let width = values.len().max(formats.len());
        let cells = (0..width)
            .map(|i| Cell {
                value: values.get(i).cloned().unwrap_or_default(),
                format: formats.get(i).cloned().unwrap_or_default(),
            })
            .collect();
        self.readdress_formulas(at, 1);
        self.rows
            .insert((at - 1) as usize, RowSnapshot { cells }.trimmed());
        Ok(())
    }

    /// Set cell values of an existing row; formats stay as they are
    pub fn write_cells(&mut self, row: u32, cells: &[(u16, CellValue)]) -> ScheduleResult<()> {
        self.check_existing(row)?;
        let target = &mut self.rows[(row - 1) as usize];
        for (col, value) in cells {
            let col = *col as usize;
            if target.cells.len() <= col {
                target.cells.resize(col + 1, Cell::default());
            }
            target.cells[col].value = value.clone();
        }
        *target = std::mem::take(target).trimmed();
        Ok(())
    }

    pub fn delete(&mut self, row: u32) -> ScheduleResult<RowSnapshot> {
        self.check_existing(row)?;
        let removed = self.rows.remove((row - 1) as usize);
        self.readdress_formulas(row + 1, -1);
        Ok(removed)
    }

    /// Follow a structural edit the way a spreadsheet application does: same-sheet
    /// references at or below `from_row` move by `delta`.
    fn readdress_formulas(&mut self, from_row: u32, delta: i64) {
        for cell in self.rows.iter_mut().flat_map(|r| r.cells.iter_mut()) {
            if let CellValue::Formula(text) = &cell.value {
                cell.value = CellValue::Formula(formula::shift_structural(text, from_row, delta));
            }
        }
    }

    fn resolve_formats(&self, formatting: &FormattingSource) -> ScheduleResult<Vec<CellFormat>> {
        match formatting {
            FormattingSource::None => Ok(Vec::new()),
            FormattingSource::Explicit(formats) => Ok(formats.clone()),
            FormattingSource::Inherit { overrides, .. } => Ok(overrides.clone()),
            FormattingSource::Row(row) => Ok(self.read(*row)?.formats()),
        }
    }

    fn check_existing(&self, row: u32) -> ScheduleResult<()> {
        if row == 0 || row > self.row_count() {
            return Err(ScheduleError::invalid_row(
                &self.name,
                row,
                format!("sheet has {} rows", self.row_count()),
            ));
        }
        Ok(())
    }
}

/// Ordered collection of sheets
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkbookData {
    pub sheets: Vec<SheetData>,
}

impl WorkbookData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used by fixtures: append a sheet whose rows are plain text values
    pub fn with_sheet<R, V>(mut self, name: &str, rows: R) -> Self
    where
        R: IntoIterator<Item = Vec<V>>,
        V: Into<CellValue>,
    {
        let mut sheet = SheetData::new(name);
        sheet.rows = rows
            .into_iter()
            .map(|values| RowSnapshot::from_values(values))
            .collect();
        self.sheets.push(sheet);
        self
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    pub fn sheet(&self, name: &str) -> ScheduleResult<&SheetData> {
        self.sheets
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ScheduleError::invalid_row(name, 0, "no such sheet"))
    }

    /// Append an empty sheet; an existing name is an error
    pub fn add_sheet(&mut self, name: &str) -> ScheduleResult<()> {
        if self.sheets.iter().any(|s| s.name == name) {
            return Err(ScheduleError::invalid_row(name, 0, "sheet already exists"));
        }
        self.sheets.push(SheetData::new(name));
        Ok(())
    }

    pub fn sheet_mut(&mut self, name: &str) -> ScheduleResult<&mut SheetData> {
        self.sheets
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ScheduleError::invalid_row(name, 0, "no such sheet"))
    }
}
