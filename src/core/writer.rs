//! Cell Writer: build a new order row from a reference row and write it
//!
//! The new row starts as a copy of the reference row (values and formatting), with
//! formulas moved to the new row, `clear_columns` blanked and the record's mapped fields
//! written over it. The identifier cell gets the record's SKU-SPEC, keeping the reference
//! row's letter case when the two differ only in case.

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{ScheduleError, ScheduleResult};
use crate::formula;
use crate::port::{DocumentPort, FormattingSource, SessionId};
use crate::types::{Cell, CellFormat, CellValue, OrderRecord, RowSnapshot};

/// Row content the writer intends to put in the sheet
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedRow {
    pub values: Vec<CellValue>,
    pub formats: Vec<CellFormat>,
    /// Fields that could not be placed
    pub warnings: Vec<String>,
}

impl ComposedRow {
    /// What a faithful read-back of this row looks like
    pub fn snapshot(&self) -> RowSnapshot {
        let width = self.values.len().max(self.formats.len());
        RowSnapshot {
            cells: (0..width)
                .map(|i| Cell {
                    value: self.values.get(i).cloned().unwrap_or_default(),
                    format: self.formats.get(i).cloned().unwrap_or_default(),
                })
                .collect(),
        }
        .trimmed()
    }
}

/// Result of a verified write
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenRow {
    pub row: u32,
    pub snapshot: RowSnapshot,
    pub warnings: Vec<String>,
}

/// Identifier value to write: the reference casing when it differs from `incoming` only by
/// case, otherwise `incoming` verbatim.
pub fn preserve_case(reference: Option<&str>, incoming: &str) -> String {
    match reference.map(str::trim) {
        Some(existing) if !existing.is_empty() && existing.eq_ignore_ascii_case(incoming.trim()) => {
            existing.to_string()
        }
        _ => incoming.to_string(),
    }
}

pub struct CellWriter<'a> {
    config: &'a EngineConfig,
}

impl<'a> CellWriter<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Compose the row that will sit at `target_row`, copied from `reference` which is
    /// currently at `reference_row`.
    pub fn compose(
        &self,
        reference: &RowSnapshot,
        reference_row: u32,
        target_row: u32,
        record: &OrderRecord,
        identifier_column: Option<u16>,
    ) -> ComposedRow {
        let delta = target_row as i64 - reference_row as i64;
        let mut values: Vec<CellValue> = reference
            .values()
            .into_iter()
            .map(|v| match v {
                CellValue::Formula(f) => CellValue::Formula(formula::shift_rows(&f, delta)),
                other => other,
            })
            .collect();
        let mut formats = reference.formats();
        let mut warnings = Vec::new();

        for col in self.config.clear_indexes() {
            if let Some(v) = values.get_mut(col as usize) {
                *v = CellValue::Empty;
            }
        }

        for (field, value) in &record.fields {
            match self.config.column_for_field(field) {
                Some(col) => set(&mut values, col, value.clone()),
                None => warnings.push(format!("field '{}' has no column mapping", field)),
            }
        }

        let id_col = identifier_column.unwrap_or_else(|| self.config.primary_identifier());
        let existing = reference.value(id_col).as_text();
        let existing = (!existing.trim().is_empty()).then_some(existing);
        let sku = preserve_case(existing.as_deref(), &record.sku_spec);
        set(&mut values, id_col, CellValue::Text(sku));

        // A date carries its own number format
        for (value, format) in values.iter().zip(formats.iter_mut()) {
            if matches!(value, CellValue::Date(_)) {
                format.number_format = None;
            }
        }

        if let Some(rgb) = self.config.highlight_rgb() {
            if formats.len() < values.len() {
                formats.resize(values.len(), CellFormat::default());
            }
            for f in formats.iter_mut() {
                f.fill = Some(rgb);
            }
        }

        ComposedRow {
            values,
            formats,
            warnings,
        }
    }

    /// Insert the composed row at `at` and read it back.
    ///
    /// A read-back that differs from the intended content is a `PartialWrite`; the caller
    /// owns cleanup of the inserted row.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        port: &dyn DocumentPort,
        session: SessionId,
        sheet: &str,
        at: u32,
        reference: &RowSnapshot,
        reference_row: u32,
        record: &OrderRecord,
        identifier_column: Option<u16>,
    ) -> ScheduleResult<WrittenRow> {
        let composed = self.compose(reference, reference_row, at, record, identifier_column);
        port.insert_row(
            session,
            sheet,
            at,
            &composed.values,
            &FormattingSource::Inherit {
                row: reference_row,
                overrides: composed.formats.clone(),
            },
        )?;

        let expected = composed.snapshot();
        let actual = port.read_row(session, sheet, at)?.trimmed();
        if actual != expected {
            warn!(sheet, row = at, record = %record.id, "read-back differs from written row");
            return Err(ScheduleError::partial_write(
                sheet,
                at,
                format!(
                    "read-back has {} cells, expected {}",
                    actual.cells.len(),
                    expected.cells.len()
                ),
            ));
        }

        Ok(WrittenRow {
            row: at,
            snapshot: expected,
            warnings: composed.warnings,
        })
    }
}

fn set(values: &mut Vec<CellValue>, col: u16, value: CellValue) {
    let col = col as usize;
    if values.len() <= col {
        values.resize(col + 1, CellValue::Empty);
    }
    values[col] = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn config() -> EngineConfig {
        let mut columns = BTreeMap::new();
        columns.insert("qty".to_string(), "I".to_string());
        columns.insert("ship_date".to_string(), "M".to_string());
        EngineConfig {
            columns,
            clear_columns: vec!["D".to_string()],
            ..EngineConfig::default()
        }
    }

    fn reference() -> RowSnapshot {
        let mut values = vec![CellValue::Empty; 10];
        values[2] = "Dino plush".into();
        values[3] = "PO-OLD".into();
        values[6] = "9296-s001".into();
        values[8] = CellValue::Number(100.0);
        values[9] = CellValue::Formula("=I12*2".into());
        RowSnapshot::from_values(values)
    }

    #[test]
    fn test_preserve_case() {
        assert_eq!(preserve_case(Some("9296-s001"), "9296-S001"), "9296-s001");
        assert_eq!(preserve_case(Some("9296-s001"), "9999-S001"), "9999-S001");
        assert_eq!(preserve_case(None, "9999-S001"), "9999-S001");
    }

    #[test]
    fn test_compose_inherits_clears_and_overwrites() {
        let config = config();
        let record = OrderRecord::new("9296", Some("S001"))
            .with_field("qty", 240.0)
            .with_field("ship_date", NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())
            .with_field("carton size", "60x40");
        let row = CellWriter::new(&config).compose(&reference(), 12, 13, &record, Some(6));

        assert_eq!(row.values[2], CellValue::Text("Dino plush".into()));
        assert_eq!(row.values[3], CellValue::Empty);
        assert_eq!(row.values[6], CellValue::Text("9296-s001".into()));
        assert_eq!(row.values[8], CellValue::Number(240.0));
        assert_eq!(row.values[9], CellValue::Formula("=I13*2".into()));
        assert!(matches!(row.values[12], CellValue::Date(_)));
        assert_eq!(row.warnings, vec!["field 'carton size' has no column mapping".to_string()]);
    }

    #[test]
    fn test_compose_highlight_covers_row() {
        let config = EngineConfig {
            highlight_new_rows: Some("DDEBF7".into()),
            ..EngineConfig::default()
        };
        let record = OrderRecord::new("9999", Some("S001"));
        let row = CellWriter::new(&config).compose(&reference(), 2, 3, &record, None);
        assert_eq!(row.values[6], CellValue::Text("9999-S001".into()));
        assert!(row.formats.len() >= row.values.len());
        assert!(row.formats.iter().all(|f| f.fill == Some(0xDDEBF7)));
    }

    #[test]
    fn test_date_field_drops_inherited_number_format() {
        let config = config();
        let mut reference = reference();
        reference.cells.resize(13, Cell::default());
        reference.cells[12].format.number_format = Some("#,##0.00".into());
        reference.cells[8].format.number_format = Some("#,##0".into());
        let record = OrderRecord::new("9296", Some("S001"))
            .with_field("ship_date", NaiveDate::from_ymd_opt(2025, 5, 1).unwrap());
        let row = CellWriter::new(&config).compose(&reference, 2, 3, &record, Some(6));
        assert_eq!(row.formats[12].number_format, None);
        assert_eq!(row.formats[8].number_format.as_deref(), Some("#,##0"));
    }
}
