//! Batch Processor: apply an ordered set of order records to one open workbook
//!
//! Records are independent: a record that cannot be matched or written becomes a failed
//! [`BatchResult`] and the batch moves on. Only fatal errors (lost session, offset desync)
//! end the batch, and then the caller discards the whole session.
//!
//! Cancellations run first, then in-place modifications, then new rows. Every record
//! addresses rows in the numbering at the start of the call, and the shared
//! [`OffsetTracker`] keeps later phases pointed at the right rows. Results still come
//! back in input order.

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ScheduleError, ScheduleResult};
use crate::formula;
use crate::identifier;
use crate::port::{DocumentPort, FormattingSource, SessionId};
use crate::types::{
    BatchResult, Cell, CellValue, MatchTier, OrderOperation, OrderRecord, RecordRef, RowAddress,
    RowSnapshot, UndoToken,
};

use super::ledger::{CellEdit, PendingDeletion, PendingModification};
use super::matcher::{ReferenceMatch, ReferenceMatcher, WorkbookIndex};
use super::offset::OffsetTracker;
use super::writer::{CellWriter, WrittenRow};

/// A verified new row, ready for the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedWrite {
    pub token: UndoToken,
    pub record: RecordRef,
    pub sheet: String,
    /// Physical row right after the insert
    pub row: u32,
    pub tier: MatchTier,
    pub snapshot: RowSnapshot,
    /// Position of the insert in the batch's mutation log
    pub mutation_index: usize,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// One result per input record, in input order
    pub results: Vec<BatchResult>,
    pub writes: Vec<CommittedWrite>,
    /// Rows removed by cancellations
    pub deletions: Vec<PendingDeletion>,
    pub modifications: Vec<PendingModification>,
    /// Rows left behind by a failed write whose cleanup also failed
    pub suspect_rows: Vec<RowAddress>,
    /// Every physical mutation of the batch, including cleanups
    pub tracker: OffsetTracker,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// An order's own row, found and checked
#[derive(Debug)]
struct ExistingRow {
    sheet: String,
    /// Row in the numbering at the start of the call
    logical_row: u32,
    /// Current physical row
    row: u32,
    snapshot: RowSnapshot,
}

pub struct BatchProcessor<'a> {
    port: &'a dyn DocumentPort,
    session: SessionId,
    config: &'a EngineConfig,
    matcher: ReferenceMatcher,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(port: &'a dyn DocumentPort, session: SessionId, config: &'a EngineConfig) -> Self {
        Self {
            port,
            session,
            config,
            matcher: ReferenceMatcher::new(config),
        }
    }

    /// Process `records`: cancellations, then modifications, then new rows.
    /// `Err` only for fatal errors.
    pub fn run(&self, records: &[OrderRecord]) -> ScheduleResult<BatchReport> {
        let index = WorkbookIndex::build(self.port, self.session, self.config)?;
        let records: Vec<OrderRecord> = records.iter().cloned().map(OrderRecord::normalized).collect();
        let mut report = BatchReport::default();
        let mut results: Vec<Option<BatchResult>> = vec![None; records.len()];

        for phase in [OrderOperation::Cancel, OrderOperation::Modify, OrderOperation::New] {
            for (i, record) in records.iter().enumerate() {
                if record.operation != phase {
                    continue;
                }
                let result = match phase {
                    OrderOperation::New => self.write_new(&index, record, &mut report)?,
                    OrderOperation::Modify | OrderOperation::Cancel => {
                        self.edit_existing(&index, record, &mut report)?
                    }
                };
                results[i] = Some(result);
            }
        }
        report.results = results.into_iter().flatten().collect();

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            suspect = report.suspect_rows.len(),
            "batch processed"
        );
        Ok(report)
    }

    fn write_new(
        &self,
        index: &WorkbookIndex,
        record: &OrderRecord,
        report: &mut BatchReport,
    ) -> ScheduleResult<BatchResult> {
        match self.matcher.find(index, record) {
            Ok(reference) => self.process(record, &reference, report),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(record = %record.id, sku_spec = %record.sku_spec, error = %e, "no reference row");
                Ok(BatchResult::failure(record.id.clone(), &e))
            }
        }
    }

    fn process(
        &self,
        record: &OrderRecord,
        reference: &ReferenceMatch,
        report: &mut BatchReport,
    ) -> ScheduleResult<BatchResult> {
        let sheet = reference.sheet.as_str();
        let tracker = &mut report.tracker;

        let current = tracker.resolve(sheet, reference.row).ok_or_else(|| {
            ScheduleError::OffsetDesync {
                sheet: sheet.to_string(),
                expected_row: reference.row,
                expected: reference.identifier.clone().unwrap_or_default(),
                found: "<deleted>".to_string(),
            }
        })?;
        let snapshot = self.port.read_row(self.session, sheet, current)?;
        self.check_in_sync(reference, current, &snapshot)?;

        let at = tracker
            .last_insert_pos(sheet)
            .map(|p| p + 1)
            .unwrap_or(current + 1);

        let writer = CellWriter::new(self.config);
        let written = writer.write(
            self.port,
            self.session,
            sheet,
            at,
            &snapshot,
            current,
            record,
            reference.column,
        );

        match written {
            Ok(WrittenRow {
                row,
                snapshot,
                warnings,
            }) => {
                tracker.register_insert(sheet, row);
                let token = UndoToken::generate();
                info!(record = %record.id, sheet, row, tier = %reference.tier, "order row written");
                report.writes.push(CommittedWrite {
                    token: token.clone(),
                    record: record.id.clone(),
                    sheet: sheet.to_string(),
                    row,
                    tier: reference.tier,
                    snapshot,
                    mutation_index: tracker.mutations().len() - 1,
                });
                let mut result = BatchResult::success(record.id.clone(), sheet, row, reference.tier);
                result.write_token = Some(token);
                result.warnings = warnings;
                Ok(result)
            }
            Err(e @ ScheduleError::PartialWrite { .. }) => {
                let mut result = BatchResult::failure(record.id.clone(), &e);
                self.remove_partial(sheet, at, record, &mut result, report);
                Ok(result)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(record = %record.id, error = %e, "write failed");
                Ok(BatchResult::failure(record.id.clone(), &e))
            }
        }
    }

    /// A row that failed half-way physically exists; take it out again before moving on
    fn remove_partial(
        &self,
        sheet: &str,
        at: u32,
        record: &OrderRecord,
        result: &mut BatchResult,
        report: &mut BatchReport,
    ) {
        report.tracker.register_insert(sheet, at);
        match self.port.delete_row(self.session, sheet, at) {
            Ok(()) => {
                report.tracker.register_delete(sheet, at);
                warn!(record = %record.id, sheet, row = at, "partial write removed");
            }
            Err(cleanup) => {
                warn!(record = %record.id, sheet, row = at, error = %cleanup, "partial row left in place, marked suspect");
                report.suspect_rows.push(RowAddress::new(sheet, at));
                result
                    .warnings
                    .push(format!("row {}!{} is suspect: {}", sheet, at, cleanup));
            }
        }
    }

    //--------------------------------------------------------------------------
    // Existing rows
    //--------------------------------------------------------------------------

    fn edit_existing(
        &self,
        index: &WorkbookIndex,
        record: &OrderRecord,
        report: &mut BatchReport,
    ) -> ScheduleResult<BatchResult> {
        let outcome = self.locate_existing(index, record, &report.tracker).and_then(|target| {
            match record.operation {
                OrderOperation::Cancel => self.cancel(record, target, report),
                _ => self.modify(record, target, report),
            }
        });
        match outcome {
            Ok(result) => Ok(result),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(record = %record.id, operation = %record.operation, error = %e, "order row not edited");
                Ok(BatchResult::failure(record.id.clone(), &e))
            }
        }
    }

    /// Find the order's own row and check it still carries the order's SKU-SPEC
    fn locate_existing(
        &self,
        index: &WorkbookIndex,
        record: &OrderRecord,
        tracker: &OffsetTracker,
    ) -> ScheduleResult<ExistingRow> {
        let (sheet, logical_row, searched) = match record.row {
            Some(row) => {
                let sheet = record.target_sheet.as_deref().ok_or_else(|| {
                    ScheduleError::invalid_row("", row, "row given without target_sheet")
                })?;
                if index.sheet(sheet).is_none() {
                    return Err(ScheduleError::invalid_row(sheet, row, "not a searchable sheet"));
                }
                (sheet.to_string(), row, false)
            }
            None => {
                let found = self.matcher.find_existing(index, record)?;
                (found.sheet, found.row, true)
            }
        };

        let row = tracker.resolve(&sheet, logical_row).ok_or_else(|| {
            ScheduleError::invalid_row(&sheet, logical_row, "row removed earlier in this call")
        })?;
        let snapshot = self.port.read_row(self.session, &sheet, row)?;

        let wanted = identifier::sku_spec(&record.sku_spec);
        let holds = self
            .config
            .identifier_indexes()
            .into_iter()
            .any(|col| identifier::sku_spec(&snapshot.value(col).as_text()) == wanted);
        if !holds {
            let found = snapshot.value(self.config.primary_identifier()).as_text();
            if searched {
                return Err(ScheduleError::OffsetDesync {
                    sheet,
                    expected_row: row,
                    expected: record.sku_spec.clone(),
                    found,
                });
            }
            return Err(ScheduleError::invalid_row(
                &sheet,
                logical_row,
                format!("row holds '{}', not '{}'", found, record.sku_spec),
            ));
        }
        Ok(ExistingRow {
            sheet,
            logical_row,
            row,
            snapshot,
        })
    }

    /// Overwrite the record's mapped fields in place
    fn modify(
        &self,
        record: &OrderRecord,
        target: ExistingRow,
        report: &mut BatchReport,
    ) -> ScheduleResult<BatchResult> {
        let ExistingRow {
            sheet,
            row,
            snapshot,
            ..
        } = target;
        let mut cells: Vec<CellEdit> = Vec::new();
        let mut warnings = Vec::new();
        for (field, value) in &record.fields {
            let Some(column) = self.config.column_for_field(field) else {
                warnings.push(format!("field '{}' has no column mapping", field));
                continue;
            };
            cells.retain(|c| c.column != column);
            cells.push(CellEdit {
                column,
                before: snapshot.value(column).clone(),
                after: value.clone(),
            });
        }
        if cells.is_empty() {
            return Err(ScheduleError::invalid_row(
                &sheet,
                row,
                "nothing to modify: no field maps to a column",
            ));
        }

        let after: Vec<(u16, CellValue)> = cells.iter().map(|c| (c.column, c.after.clone())).collect();
        self.port.write_cells(self.session, &sheet, row, &after)?;
        let written = self.port.read_row(self.session, &sheet, row)?;
        if let Some(bad) = cells.iter().find(|c| !written.value(c.column).same_as(&c.after)) {
            let error = ScheduleError::partial_write(
                &sheet,
                row,
                format!("column {} reads back differently", identifier::column_index_to_letter(bad.column)),
            );
            let mut result = BatchResult::failure(record.id.clone(), &error);
            let before: Vec<(u16, CellValue)> =
                cells.iter().map(|c| (c.column, c.before.clone())).collect();
            if let Err(cleanup) = self.port.write_cells(self.session, &sheet, row, &before) {
                warn!(record = %record.id, sheet = %sheet, row, error = %cleanup, "edited row left half-modified, marked suspect");
                report.suspect_rows.push(RowAddress::new(&sheet, row));
                result
                    .warnings
                    .push(format!("row {}!{} is suspect: {}", sheet, row, cleanup));
            }
            return Ok(result);
        }

        let token = UndoToken::generate();
        info!(record = %record.id, sheet = %sheet, row, cells = cells.len(), "order row modified");
        report.modifications.push(PendingModification {
            token: token.clone(),
            record: record.id.clone(),
            sheet: sheet.clone(),
            row,
            cells,
            mutations_before: report.tracker.mutations().len(),
        });
        let mut result = BatchResult::success(record.id.clone(), sheet, row, MatchTier::ExactSkuSpec);
        result.undo_token = Some(token);
        result.warnings = warnings;
        Ok(result)
    }

    /// Copy the row to the archive sheet (when enabled), then delete it
    fn cancel(
        &self,
        record: &OrderRecord,
        target: ExistingRow,
        report: &mut BatchReport,
    ) -> ScheduleResult<BatchResult> {
        let ExistingRow {
            sheet,
            logical_row,
            row,
            snapshot,
        } = target;

        if self.config.cancel.archive {
            let archive = self.archive_sheet()?;
            let at = self.port.row_count(self.session, &archive)? + 1;
            let copy = self.archived_copy(&snapshot, at as i64 - row as i64);
            let inserted = self
                .port
                .insert_row(
                    self.session,
                    &archive,
                    at,
                    &copy.values(),
                    &FormattingSource::Explicit(copy.formats()),
                )
                .and_then(|()| {
                    let actual = self.port.read_row(self.session, &archive, at)?.trimmed();
                    if actual == copy.clone().trimmed() {
                        Ok(())
                    } else {
                        Err(ScheduleError::partial_write(
                            &archive,
                            at,
                            "archived copy differs from the cancelled row",
                        ))
                    }
                });
            match inserted {
                Ok(()) => {
                    report.tracker.register_insert(&archive, at);
                    debug!(record = %record.id, sheet = %archive, row = at, "cancelled row archived");
                }
                Err(e @ ScheduleError::PartialWrite { .. }) => {
                    let mut result = BatchResult::failure(record.id.clone(), &e);
                    self.remove_partial(&archive, at, record, &mut result, report);
                    return Ok(result);
                }
                Err(e) => return Err(e),
            }
        }

        self.port.delete_row(self.session, &sheet, row)?;
        report.tracker.register_delete(&sheet, row);
        let token = UndoToken::generate();
        info!(record = %record.id, sheet = %sheet, row, "order row cancelled");
        report.deletions.push(PendingDeletion {
            undo_token: token.clone(),
            sheet: sheet.clone(),
            logical_row,
            row,
            snapshot,
            mutation_index: report.tracker.mutations().len() - 1,
        });
        let mut result = BatchResult::success(record.id.clone(), sheet, row, MatchTier::ExactSkuSpec);
        result.undo_token = Some(token);
        Ok(result)
    }

    /// Existing archive sheet, or a new one at the end of the workbook
    fn archive_sheet(&self) -> ScheduleResult<String> {
        let names = self.port.sheet_names(self.session)?;
        if let Some(name) = names.into_iter().find(|n| self.config.cancel.is_archive(n)) {
            return Ok(name);
        }
        let name = self.config.cancel.sheet.trim().to_string();
        self.port.add_sheet(self.session, &name)?;
        info!(sheet = %name, "cancellation sheet added");
        Ok(name)
    }

    /// The cancelled row as it lands in the archive: formulas moved by `delta` rows, every
    /// cell in the archive colours
    fn archived_copy(&self, snapshot: &RowSnapshot, delta: i64) -> RowSnapshot {
        let font = self.config.cancel.font_rgb();
        let fill = self.config.cancel.fill_rgb();
        let cells = snapshot
            .cells
            .iter()
            .map(|cell| {
                let mut cell: Cell = cell.clone();
                if let CellValue::Formula(text) = &cell.value {
                    cell.value = CellValue::Formula(formula::shift_rows(text, delta));
                }
                cell.format.font_color = Some(font);
                cell.format.fill = Some(fill);
                cell
            })
            .collect();
        RowSnapshot { cells }
    }

    /// The row the tracker points at must still carry the identifier seen at match time
    fn check_in_sync(
        &self,
        reference: &ReferenceMatch,
        current: u32,
        snapshot: &RowSnapshot,
    ) -> ScheduleResult<()> {
        let (Some(expected), Some(col)) = (&reference.identifier, reference.column) else {
            return Ok(());
        };
        let found = snapshot.value(col).as_text();
        if found.trim() != expected.trim() {
            return Err(ScheduleError::OffsetDesync {
                sheet: reference.sheet.clone(),
                expected_row: current,
                expected: expected.clone(),
                found,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Fault, MemoryPort, WorkbookData};
    use std::path::Path;

    fn workbook() -> WorkbookData {
        // identifier in column A keeps fixtures small
        WorkbookData::new().with_sheet(
            "S",
            vec![vec!["ITEM"], vec!["1001-S001"], vec!["2002-S001"], vec!["3003-S001"]],
        )
    }

    fn config() -> EngineConfig {
        EngineConfig {
            identifier_columns: vec!["A".to_string()],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_consecutive_records_stack_below_last_insert() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let records = vec![
            OrderRecord::new("1001", Some("S001")),
            OrderRecord::new("3003", Some("S001")),
        ];
        let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.results[0].matched_row, Some(3));
        // second record goes right after the first insert, not after its own reference
        assert_eq!(report.results[1].matched_row, Some(4));
        assert_eq!(report.tracker.mutations().len(), 2);
    }

    #[test]
    fn test_partial_write_is_cleaned_up() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        port.inject(Fault::PartialInsert { after: 0 });
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let report = BatchProcessor::new(&port, session, &config)
            .run(&[OrderRecord::new("2002", Some("S001")).with_field("B", "x")])
            .unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(report.results[0].error_kind.as_deref(), Some("partial_write"));
        assert!(report.writes.is_empty());
        assert!(report.suspect_rows.is_empty());
        assert_eq!(port.row_count(session, "S").unwrap(), 4);
    }

    #[test]
    fn test_failed_cleanup_marks_row_suspect() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        port.inject(Fault::PartialInsert { after: 0 });
        port.inject(Fault::LockedOnDelete { after: 0 });
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let report = BatchProcessor::new(&port, session, &config)
            .run(&[OrderRecord::new("2002", Some("S001")).with_field("B", "x")])
            .unwrap();
        assert_eq!(report.suspect_rows, vec![RowAddress::new("S", 4)]);
        assert!(report.writes.is_empty());
        assert_eq!(report.results[0].warnings.len(), 1);
    }

    #[test]
    fn test_cancel_runs_first_and_results_keep_input_order() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let records = vec![
            OrderRecord::new("3003", Some("S001")),
            OrderRecord::new("1001", Some("S001")).with_operation(OrderOperation::Cancel),
        ];
        let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();

        assert_eq!(report.succeeded(), 2);
        // 3003 moved up one row before its new row went in
        assert_eq!(report.results[0].matched_row, Some(4));
        assert_eq!(report.results[1].matched_row, Some(2));
        assert!(report.results[1].undo_token.is_some());
        assert_eq!(report.deletions.len(), 1);
        assert_eq!(report.deletions[0].logical_row, 2);

        let names = port.sheet_names(session).unwrap();
        assert_eq!(names, vec!["S".to_string(), "Cancelled".to_string()]);
        let archived = port.read_row(session, "Cancelled", 1).unwrap();
        assert_eq!(archived.value(0).as_text(), "1001-S001");
        assert_eq!(archived.cells[0].format.font_color, Some(0xFF0000));
        assert_eq!(archived.cells[0].format.fill, Some(0x00B0F0));
        assert_eq!(port.read_row(session, "S", 2).unwrap().value(0).as_text(), "2002-S001");
    }

    #[test]
    fn test_cancel_without_archive_only_deletes() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let mut config = config();
        config.cancel.archive = false;
        let report = BatchProcessor::new(&port, session, &config)
            .run(&[OrderRecord::new("2002", Some("S001")).with_operation(OrderOperation::Cancel)])
            .unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(port.sheet_names(session).unwrap(), vec!["S".to_string()]);
        assert_eq!(port.row_count(session, "S").unwrap(), 3);
    }

    #[test]
    fn test_given_row_must_hold_the_order() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let report = BatchProcessor::new(&port, session, &config)
            .run(&[OrderRecord::new("1001", Some("S001"))
                .with_operation(OrderOperation::Cancel)
                .at_row("S", 3)])
            .unwrap();
        assert_eq!(report.results[0].error_kind.as_deref(), Some("invalid_row"));
        assert!(report.tracker.mutations().is_empty());
        assert_eq!(port.row_count(session, "S").unwrap(), 4);
    }

    #[test]
    fn test_modify_overwrites_in_place_and_records_old_values() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let records = vec![
            OrderRecord::new("2002", Some("S001"))
                .with_operation(OrderOperation::Modify)
                .with_field("B", "rush"),
            OrderRecord::new("1001", Some("S001")).with_operation(OrderOperation::Cancel),
        ];
        let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();

        assert_eq!(report.succeeded(), 2);
        // 2002 was at row 3 at the start of the call; the cancel moved it to 2
        assert_eq!(report.results[0].matched_row, Some(2));
        let row = port.read_row(session, "S", 2).unwrap();
        assert_eq!(row.value(0).as_text(), "2002-S001");
        assert_eq!(row.value(1), &CellValue::Text("rush".into()));

        let modification = &report.modifications[0];
        assert_eq!(modification.cells.len(), 1);
        assert_eq!(modification.cells[0].before, CellValue::Empty);
        // the cancel's archive insert and delete both happened first
        assert_eq!(modification.mutations_before, 2);
    }

    #[test]
    fn test_modify_with_no_mapped_field_fails() {
        let port = MemoryPort::new().with_workbook("w.xlsx", workbook());
        let session = port.open(Path::new("w.xlsx")).unwrap();
        let config = config();
        let report = BatchProcessor::new(&port, session, &config)
            .run(&[OrderRecord::new("2002", Some("S001"))
                .with_operation(OrderOperation::Modify)
                .with_field("carton size", "60x40")])
            .unwrap();
        assert_eq!(report.failed(), 1);
        assert!(report.modifications.is_empty());
    }
}
