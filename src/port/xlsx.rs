//! .xlsx binding of the Document Port
//!
//! Opening a session loads the whole workbook with umya-spreadsheet and every mutation
//! edits that document in place, so cell styles, column widths, merged ranges and sheets
//! the engine never reads survive a save untouched. Row inserts and deletes go through
//! umya's structural edits, which re-address formulas the way a spreadsheet application
//! does. `save` writes a temp file in the same directory and renames it over the original,
//! so a failed save never leaves a truncated workbook behind.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use tempfile::Builder;
use umya_spreadsheet::{Spreadsheet, Style, Worksheet};

use crate::error::{ScheduleError, ScheduleResult};
use crate::types::{Cell, CellFormat, CellValue, RowSnapshot};

use super::{DocumentPort, FormattingSource, SessionId};

const DATE_FORMAT: &str = "yyyy-mm-dd";
const GENERAL: &str = "General";
const BLACK: u32 = 0x000000;

/// Days between the spreadsheet epoch (1899-12-30) and `date`
pub fn date_serial(date: NaiveDate) -> f64 {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or_default();
    (date - epoch).num_days() as f64
}

/// Inverse of [`date_serial`] for whole-day serials
pub fn date_from_serial(serial: f64) -> Option<NaiveDate> {
    if serial.fract() != 0.0 || serial < 1.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(chrono::Duration::days(serial as i64))
}

/// Number format codes that display a date. Quoted literals and `[..]` sections
/// (colours, locales, elapsed time) do not count.
pub fn is_date_code(code: &str) -> bool {
    let mut plain = String::with_capacity(code.len());
    let mut quoted = false;
    let mut bracket = false;
    for c in code.chars() {
        match c {
            '"' => quoted = !quoted,
            '[' if !quoted => bracket = true,
            ']' if !quoted => bracket = false,
            _ if quoted || bracket => {}
            _ => plain.push(c.to_ascii_lowercase()),
        }
    }
    plain.contains('y') || plain.contains('d')
}

fn argb(rgb: u32) -> String {
    format!("FF{:06X}", rgb & 0xFF_FFFF)
}

/// `AARRGGBB` or `RRGGBB` to 0xRRGGBB; theme and indexed colours have no ARGB text
fn parse_argb(text: &str) -> Option<u32> {
    let digits = text.trim();
    let digits = match digits.len() {
        8 => &digits[2..],
        6 => digits,
        _ => return None,
    };
    u32::from_str_radix(digits, 16).ok()
}

#[derive(Debug)]
struct Session {
    path: PathBuf,
    book: Spreadsheet,
}

#[derive(Debug, Default)]
struct Sessions {
    open: HashMap<SessionId, Session>,
    next: u64,
}

/// Workbooks on the local filesystem
#[derive(Debug, Default)]
pub struct XlsxPort {
    sessions: Mutex<Sessions>,
}

impl XlsxPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_book<T>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut Spreadsheet) -> ScheduleResult<T>,
    ) -> ScheduleResult<T> {
        let mut sessions = self.lock();
        let s = sessions.open.get_mut(&session).ok_or_else(|| {
            ScheduleError::document_lock(PathBuf::new(), format!("{} is not open", session))
        })?;
        f(&mut s.book)
    }
}

/// Fails with `DocumentLock` when the file cannot be opened for writing
/// (read-only, held by another program, missing).
fn probe_writable(path: &Path) -> ScheduleResult<()> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| ScheduleError::document_lock(path, e))
}

fn worksheet<'b>(book: &'b Spreadsheet, name: &str) -> ScheduleResult<&'b Worksheet> {
    book.get_sheet_by_name(name)
        .ok_or_else(|| ScheduleError::invalid_row(name, 0, "no such sheet"))
}

fn worksheet_mut<'b>(book: &'b mut Spreadsheet, name: &str) -> ScheduleResult<&'b mut Worksheet> {
    book.get_sheet_by_name_mut(name)
        .ok_or_else(|| ScheduleError::invalid_row(name, 0, "no such sheet"))
}

fn check_existing(sheet: &Worksheet, row: u32) -> ScheduleResult<()> {
    let count = sheet.get_highest_row();
    if row == 0 || row > count {
        return Err(ScheduleError::invalid_row(
            sheet.get_name(),
            row,
            format!("sheet has {} rows", count),
        ));
    }
    Ok(())
}

//------------------------------------------------------------------------------
// Reading
//------------------------------------------------------------------------------

fn number_format(style: &Style) -> &str {
    style
        .get_number_format()
        .map(|f| f.get_format_code())
        .unwrap_or(GENERAL)
}

fn read_value(cell: &umya_spreadsheet::Cell) -> CellValue {
    if cell.is_formula() {
        let text = cell.get_formula();
        return CellValue::Formula(format!("={}", text.trim_start_matches('=')));
    }
    let raw = cell.get_value();
    if raw.is_empty() {
        return CellValue::Empty;
    }
    match cell.get_data_type() {
        "n" => match raw.trim().parse::<f64>() {
            Ok(n) if is_date_code(number_format(cell.get_style())) => date_from_serial(n)
                .map(CellValue::Date)
                .unwrap_or(CellValue::Number(n)),
            Ok(n) => CellValue::Number(n),
            Err(_) => CellValue::Text(raw.to_string()),
        },
        "b" => CellValue::Bool(matches!(raw.trim(), "1" | "TRUE" | "true")),
        _ => CellValue::Text(raw.to_string()),
    }
}

/// The part of a cell style the engine carries between rows. Date codes are implied by
/// a `Date` value and left out.
fn read_format(style: &Style) -> CellFormat {
    let code = number_format(style);
    let number_format = (code != GENERAL && !is_date_code(code)).then(|| code.to_string());
    let fill = style
        .get_background_color()
        .and_then(|c| parse_argb(c.get_argb()));
    let (font_color, bold) = match style.get_font() {
        Some(font) => (
            parse_argb(font.get_color().get_argb()).filter(|&rgb| rgb != BLACK),
            matches!(font.get_bold(), true),
        ),
        None => (None, false),
    };
    CellFormat {
        number_format,
        fill,
        font_color,
        bold,
    }
}

fn read_row(sheet: &Worksheet, row: u32) -> RowSnapshot {
    let width = sheet.get_highest_column();
    let cells = (1..=width)
        .map(|col| match sheet.get_cell((col, row)) {
            Some(cell) => Cell {
                value: read_value(cell),
                format: read_format(cell.get_style()),
            },
            None => Cell::default(),
        })
        .collect();
    RowSnapshot { cells }.trimmed()
}

//------------------------------------------------------------------------------
// Writing
//------------------------------------------------------------------------------

/// Bring `style` in line with `format`, then make the number format fit `value`
fn apply_format(style: &mut Style, format: &CellFormat, value: &CellValue) {
    let current = number_format(style).to_string();
    let code = match (value, &format.number_format) {
        (CellValue::Date(_), _) if is_date_code(&current) => current,
        (CellValue::Date(_), _) => DATE_FORMAT.to_string(),
        (_, Some(code)) => code.clone(),
        (CellValue::Number(_), None) => GENERAL.to_string(),
        (_, None) if is_date_code(&current) => current,
        (_, None) => GENERAL.to_string(),
    };
    style.get_number_format_mut().set_format_code(code);

    match format.fill {
        Some(rgb) => {
            style.set_background_color(argb(rgb));
        }
        None if style.get_background_color().is_some() => {
            *style.get_fill_mut() = umya_spreadsheet::Fill::default();
        }
        None => {}
    }

    let font = style.get_font_mut();
    font.set_bold(format.bold);
    match format.font_color {
        Some(rgb) => {
            font.get_color_mut().set_argb(argb(rgb));
        }
        None if parse_argb(font.get_color().get_argb()).is_some_and(|rgb| rgb != BLACK) => {
            font.get_color_mut().set_argb(argb(BLACK));
        }
        None => {}
    }
}

/// Number format adjustments a bare value write needs to read back as itself
fn fit_number_format(style: &mut Style, value: &CellValue) -> bool {
    let current = is_date_code(number_format(style));
    let code = match value {
        CellValue::Date(_) if !current => DATE_FORMAT,
        CellValue::Number(_) if current => GENERAL,
        _ => return false,
    };
    style.get_number_format_mut().set_format_code(code);
    true
}

fn write_value(cell: &mut umya_spreadsheet::Cell, value: &CellValue) {
    match value {
        CellValue::Empty => {
            cell.set_cell_value(umya_spreadsheet::CellValue::default());
        }
        CellValue::Text(s) => {
            cell.set_value_string(s.clone());
        }
        CellValue::Number(n) => {
            cell.set_value_number(*n);
        }
        CellValue::Bool(b) => {
            cell.set_value_bool(*b);
        }
        CellValue::Date(d) => {
            cell.set_value_number(date_serial(*d));
        }
        CellValue::Formula(text) => {
            cell.set_formula(text.trim_start_matches('=').to_string());
        }
    }
}

/// Styles of a row's cells, column A first; `None` where no cell exists
fn row_styles(sheet: &Worksheet, row: u32) -> Vec<Option<Style>> {
    let width = sheet.get_highest_column();
    (1..=width)
        .map(|col| sheet.get_cell((col, row)).map(|c| c.get_style().clone()))
        .collect()
}

fn insert(
    book: &mut Spreadsheet,
    name: &str,
    at: u32,
    values: &[CellValue],
    formatting: &FormattingSource,
) -> ScheduleResult<()> {
    let sheet = worksheet(book, name)?;
    let count = sheet.get_highest_row();
    if at == 0 || at > count + 1 {
        return Err(ScheduleError::invalid_row(
            name,
            at,
            format!("insert position outside 1..={}", count + 1),
        ));
    }
    let (base, overrides): (Vec<Option<Style>>, Option<&[CellFormat]>) = match formatting {
        FormattingSource::None => (Vec::new(), None),
        FormattingSource::Explicit(formats) => (Vec::new(), Some(formats.as_slice())),
        FormattingSource::Row(row) => {
            check_existing(sheet, *row)?;
            (row_styles(sheet, *row), None)
        }
        FormattingSource::Inherit { row, overrides } => {
            check_existing(sheet, *row)?;
            (row_styles(sheet, *row), Some(overrides.as_slice()))
        }
    };

    book.insert_new_row(name, &at, &1);
    let sheet = worksheet_mut(book, name)?;

    let width = values
        .len()
        .max(base.len())
        .max(overrides.map(|o| o.len()).unwrap_or(0));
    for i in 0..width {
        let value = values.get(i).cloned().unwrap_or_default();
        let inherited = base.get(i).cloned().flatten();
        let format = overrides.and_then(|o| o.get(i));
        if value.is_empty() && inherited.is_none() && format.map_or(true, CellFormat::is_default) {
            continue;
        }

        let mut style = inherited.unwrap_or_default();
        match format {
            Some(format) => apply_format(&mut style, format, &value),
            None => {
                fit_number_format(&mut style, &value);
            }
        }
        let cell = sheet.get_cell_mut((i as u32 + 1, at));
        write_value(cell, &value);
        cell.set_style(style);
    }
    Ok(())
}

fn save_atomic(path: &Path, book: &Spreadsheet) -> ScheduleResult<()> {
    // `parent()` is `Some("")` for bare file names
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = Builder::new()
        .prefix(".schedule-forge-")
        .suffix(".xlsx")
        .tempfile_in(dir)
        .map_err(|e| ScheduleError::document_lock(path, e))?;
    umya_spreadsheet::writer::xlsx::write(book, tmp.path())
        .map_err(|e| ScheduleError::document_lock(path, format!("failed to write workbook: {}", e)))?;
    tmp.persist(path)
        .map_err(|e| ScheduleError::document_lock(path, e.error))?;
    Ok(())
}

impl DocumentPort for XlsxPort {
    fn open(&self, path: &Path) -> ScheduleResult<SessionId> {
        if self.lock().open.values().any(|s| s.path == path) {
            return Err(ScheduleError::document_lock(
                path,
                "workbook already open in another session",
            ));
        }
        probe_writable(path)?;
        let book = umya_spreadsheet::reader::xlsx::read(path)
            .map_err(|e| ScheduleError::document_lock(path, format!("failed to open: {}", e)))?;
        tracing::debug!(path = %path.display(), sheets = book.get_sheet_collection().len(), "workbook loaded");

        let mut sessions = self.lock();
        // Re-check: another thread may have opened the same file while we were loading
        if sessions.open.values().any(|s| s.path == path) {
            return Err(ScheduleError::document_lock(
                path,
                "workbook already open in another session",
            ));
        }
        sessions.next += 1;
        let id = SessionId(sessions.next);
        sessions.open.insert(
            id,
            Session {
                path: path.to_path_buf(),
                book,
            },
        );
        Ok(id)
    }

    fn sheet_names(&self, session: SessionId) -> ScheduleResult<Vec<String>> {
        self.with_book(session, |book| {
            Ok(book
                .get_sheet_collection()
                .iter()
                .map(|s| s.get_name().to_string())
                .collect())
        })
    }

    fn row_count(&self, session: SessionId, sheet: &str) -> ScheduleResult<u32> {
        self.with_book(session, |book| Ok(worksheet(book, sheet)?.get_highest_row()))
    }

    fn read_row(&self, session: SessionId, sheet: &str, row: u32) -> ScheduleResult<RowSnapshot> {
        self.with_book(session, |book| {
            let ws = worksheet(book, sheet)?;
            check_existing(ws, row)?;
            Ok(read_row(ws, row))
        })
    }

    fn insert_row(
        &self,
        session: SessionId,
        sheet: &str,
        at: u32,
        values: &[CellValue],
        formatting: &FormattingSource,
    ) -> ScheduleResult<()> {
        self.with_book(session, |book| insert(book, sheet, at, values, formatting))
    }

    fn delete_row(&self, session: SessionId, sheet: &str, row: u32) -> ScheduleResult<()> {
        self.with_book(session, |book| {
            check_existing(worksheet(book, sheet)?, row)?;
            book.remove_row(sheet, &row, &1);
            Ok(())
        })
    }

    fn write_cells(
        &self,
        session: SessionId,
        sheet: &str,
        row: u32,
        cells: &[(u16, CellValue)],
    ) -> ScheduleResult<()> {
        self.with_book(session, |book| {
            let ws = worksheet_mut(book, sheet)?;
            check_existing(ws, row)?;
            for (col, value) in cells {
                let cell = ws.get_cell_mut((*col as u32 + 1, row));
                let mut style = cell.get_style().clone();
                if fit_number_format(&mut style, value) {
                    cell.set_style(style);
                }
                write_value(cell, value);
            }
            Ok(())
        })
    }

    fn add_sheet(&self, session: SessionId, name: &str) -> ScheduleResult<()> {
        self.with_book(session, |book| {
            book.new_sheet(name)
                .map(|_| ())
                .map_err(|e| ScheduleError::invalid_row(name, 0, e))
        })
    }

    fn save(&self, session: SessionId) -> ScheduleResult<()> {
        let sessions = self.lock();
        let s = sessions.open.get(&session).ok_or_else(|| {
            ScheduleError::document_lock(PathBuf::new(), format!("{} is not open", session))
        })?;
        save_atomic(&s.path, &s.book)?;
        tracing::debug!(path = %s.path.display(), "workbook saved");
        Ok(())
    }

    fn close(&self, session: SessionId) -> ScheduleResult<()> {
        self.lock().open.remove(&session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_serial() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(date_serial(d), 45658.0);
        assert_eq!(date_from_serial(45658.0), Some(d));
        assert_eq!(date_from_serial(45658.5), None);
    }

    #[test]
    fn test_date_codes() {
        assert!(is_date_code("yyyy-mm-dd"));
        assert!(is_date_code("m/d/yy"));
        assert!(is_date_code("[$-409]d-mmm"));
        assert!(!is_date_code("General"));
        assert!(!is_date_code("0.00"));
        assert!(!is_date_code("[Red]#,##0"));
        assert!(!is_date_code("#,##0 \"pcs\""));
    }

    #[test]
    fn test_argb_round_trip() {
        assert_eq!(argb(0x12AB34), "FF12AB34");
        assert_eq!(parse_argb("FF12AB34"), Some(0x12AB34));
        assert_eq!(parse_argb("12ab34"), Some(0x12AB34));
        assert_eq!(parse_argb(""), None);
    }

    #[test]
    fn test_dates_get_a_date_format() {
        let d = CellValue::Date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        let mut style = Style::default();
        apply_format(&mut style, &CellFormat::default(), &d);
        assert_eq!(number_format(&style), DATE_FORMAT);

        // a plain number written over a date style must read back as a number
        apply_format(&mut style, &CellFormat::default(), &CellValue::Number(3.0));
        assert_eq!(number_format(&style), GENERAL);
    }

    #[test]
    fn test_missing_file_is_document_lock() {
        let port = XlsxPort::new();
        let err = port.open(Path::new("/nonexistent/plan.xlsx")).unwrap_err();
        assert!(matches!(err, ScheduleError::DocumentLock { .. }));
    }
}
