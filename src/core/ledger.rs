//! Deletion Ledger: undoable deletes, committed-write records and the mutation journal
//!
//! Work happens in two phases. The session phase mutates an open workbook and returns a
//! [`LedgerChange`]; [`DeletionLedger::commit`] then persists that change *before* the
//! caller saves the workbook, so nothing reaches disk without a ledger entry. If the save
//! fails the caller takes the commit back with [`DeletionLedger::restore`], which only
//! touches the entry of that one workbook.
//!
//! Rows in the ledger are physical positions at the time of the mutation. The per-workbook
//! journal keeps every later mutation, so undo and revert can replay them through an
//! [`OffsetTracker`] to find where the row is now.
//!
//! Callers hold the workbook's lock for anything that changes that workbook's entry;
//! the store itself keeps concurrent commits to different workbooks apart.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{ScheduleError, ScheduleResult};
use crate::port::{DocumentPort, FormattingSource, SessionId};
use crate::store::{transact, StateStore};
use crate::types::{CellValue, RecordRef, RowAddress, RowSnapshot, Timestamp, UndoToken};

use super::batch::{BatchReport, CommittedWrite};
use super::offset::{Mutation, MutationOp, OffsetTracker};

/// A deleted row, restorable until consumed or evicted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub undo_token: UndoToken,
    pub sheet: String,
    /// Row as the caller addressed it
    pub logical_row: u32,
    /// Physical row it was removed from
    pub row: u32,
    pub snapshot: RowSnapshot,
    pub timestamp: Timestamp,
    /// Journal position of the delete itself
    pub seq: u64,
}

/// A committed order row, revertible until consumed or evicted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub token: UndoToken,
    pub record: RecordRef,
    pub sheet: String,
    /// Physical row right after the insert
    pub row: u32,
    pub snapshot: RowSnapshot,
    pub timestamp: Timestamp,
    /// Journal position of the insert itself
    pub seq: u64,
}

/// One cell of an in-place edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellEdit {
    pub column: u16,
    pub before: CellValue,
    pub after: CellValue,
}

/// Cells of an existing row overwritten in place, revertible until consumed or evicted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub token: UndoToken,
    pub record: RecordRef,
    pub sheet: String,
    /// Physical row at the time of the edit
    pub row: u32,
    pub cells: Vec<CellEdit>,
    pub timestamp: Timestamp,
    /// First journal position after the edit
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub mutation: Mutation,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkbookLedger {
    pub next_seq: u64,
    pub journal: Vec<JournalEntry>,
    pub deletions: Vec<DeletionRecord>,
    pub writes: Vec<WriteRecord>,
    #[serde(default)]
    pub modifications: Vec<ModificationRecord>,
}

impl WorkbookLedger {
    /// Mutations recorded after journal position `seq`
    fn tracker_after(&self, seq: u64) -> OffsetTracker {
        self.tracker_from(seq + 1)
    }

    /// Mutations recorded at or after journal position `since`
    fn tracker_from(&self, since: u64) -> OffsetTracker {
        OffsetTracker::replay(
            self.journal
                .iter()
                .filter(|e| e.seq >= since)
                .map(|e| &e.mutation),
        )
    }

    fn holds(&self, token: &UndoToken) -> bool {
        self.deletions.iter().any(|d| &d.undo_token == token)
            || self.writes.iter().any(|w| &w.token == token)
            || self.modifications.iter().any(|m| &m.token == token)
    }

    /// Drop the record behind `token`; false when there is none
    fn remove(&mut self, token: &UndoToken) -> bool {
        let found = self.holds(token);
        self.deletions.retain(|d| &d.undo_token != token);
        self.writes.retain(|w| &w.token != token);
        self.modifications.retain(|m| &m.token != token);
        found
    }

    /// Drop journal entries no live record needs
    fn prune(&mut self) {
        let keep_from = self
            .deletions
            .iter()
            .map(|d| d.seq + 1)
            .chain(self.writes.iter().map(|w| w.seq + 1))
            .chain(self.modifications.iter().map(|m| m.since))
            .min();
        match keep_from {
            Some(since) => self.journal.retain(|e| e.seq >= since),
            None => self.journal.clear(),
        }
    }
}

/// Whole persisted ledger, keyed by workbook path
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub workbooks: BTreeMap<String, WorkbookLedger>,
}

/// Outcome of a session phase, not yet persisted
#[derive(Debug, Clone, Default)]
pub struct LedgerChange {
    /// Physical mutations in the order they happened
    pub mutations: Vec<Mutation>,
    /// Deleted rows, in mutation order; `seq` is filled on commit
    pub deletions: Vec<PendingDeletion>,
    /// New order rows; `seq` is filled on commit
    pub writes: Vec<CommittedWrite>,
    /// In-place edits; `since` is filled on commit
    pub modifications: Vec<PendingModification>,
    /// Tokens whose records are used up by this change
    pub consumed: Vec<UndoToken>,
}

/// A deletion awaiting commit; `mutation_index` points into `LedgerChange::mutations`
#[derive(Debug, Clone)]
pub struct PendingDeletion {
    pub undo_token: UndoToken,
    pub sheet: String,
    pub logical_row: u32,
    pub row: u32,
    pub snapshot: RowSnapshot,
    pub mutation_index: usize,
}

/// An in-place edit awaiting commit; `mutations_before` counts the entries of
/// `LedgerChange::mutations` that happened before it
#[derive(Debug, Clone)]
pub struct PendingModification {
    pub token: UndoToken,
    pub record: RecordRef,
    pub sheet: String,
    pub row: u32,
    pub cells: Vec<CellEdit>,
    pub mutations_before: usize,
}

impl LedgerChange {
    /// Change describing a finished batch
    pub fn from_batch(report: &BatchReport) -> Self {
        Self {
            mutations: report.tracker.mutations().to_vec(),
            deletions: report.deletions.clone(),
            writes: report.writes.clone(),
            modifications: report.modifications.clone(),
            consumed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.consumed.is_empty() && self.modifications.is_empty()
    }
}

/// Which kind of entry a token addresses
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    Deletion(DeletionRecord),
    Write(WriteRecord),
    Modification(ModificationRecord),
}

/// Takes back one [`DeletionLedger::commit`]: the workbook's entry as it was before
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRollback {
    workbook: String,
    before: Option<WorkbookLedger>,
}

pub struct DeletionLedger {
    store: Arc<dyn StateStore<LedgerState>>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl DeletionLedger {
    pub fn new(
        store: Arc<dyn StateStore<LedgerState>>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn state(&self) -> ScheduleResult<LedgerState> {
        self.store.load()
    }

    /// Deletion and write records for one workbook, oldest first
    pub fn entries(&self, workbook: &Path) -> ScheduleResult<WorkbookLedger> {
        let state = self.store.load()?;
        Ok(state
            .workbooks
            .get(&key(workbook))
            .cloned()
            .unwrap_or_default())
    }

    /// Find the workbook and record a token belongs to
    pub fn locate(&self, token: &UndoToken) -> ScheduleResult<(String, LedgerEntry)> {
        let state = self.store.load()?;
        for (path, ledger) in &state.workbooks {
            if let Some(d) = ledger.deletions.iter().find(|d| &d.undo_token == token) {
                return Ok((path.clone(), LedgerEntry::Deletion(d.clone())));
            }
            if let Some(w) = ledger.writes.iter().find(|w| &w.token == token) {
                return Ok((path.clone(), LedgerEntry::Write(w.clone())));
            }
            if let Some(m) = ledger.modifications.iter().find(|m| &m.token == token) {
                return Ok((path.clone(), LedgerEntry::Modification(m.clone())));
            }
        }
        Err(unavailable(token))
    }

    //--------------------------------------------------------------------------
    // Session phase
    //--------------------------------------------------------------------------

    /// Delete rows addressed in the numbering at the start of the call.
    ///
    /// Each row is snapshotted before removal; the returned change carries one pending
    /// deletion per entry, in input order.
    pub fn delete(
        &self,
        port: &dyn DocumentPort,
        session: SessionId,
        entries: &[RowAddress],
    ) -> ScheduleResult<LedgerChange> {
        let mut tracker = OffsetTracker::new();
        let mut change = LedgerChange::default();

        for entry in entries {
            let row = tracker.resolve(&entry.sheet, entry.row).ok_or_else(|| {
                ScheduleError::invalid_row(&entry.sheet, entry.row, "row deleted earlier in this call")
            })?;
            let snapshot = port.read_row(session, &entry.sheet, row)?;
            port.delete_row(session, &entry.sheet, row)?;
            tracker.register_delete(&entry.sheet, row);
            debug!(sheet = %entry.sheet, logical_row = entry.row, row, "row deleted");

            change.deletions.push(PendingDeletion {
                undo_token: UndoToken::generate(),
                sheet: entry.sheet.clone(),
                logical_row: entry.row,
                row,
                snapshot,
                mutation_index: tracker.mutations().len() - 1,
            });
        }
        change.mutations = tracker.mutations().to_vec();
        Ok(change)
    }

    /// Re-insert a deleted row where its neighbours are now.
    ///
    /// Returns the restored address and the change consuming the token.
    pub fn undo(
        &self,
        port: &dyn DocumentPort,
        session: SessionId,
        workbook: &Path,
        token: &UndoToken,
    ) -> ScheduleResult<(RowAddress, LedgerChange)> {
        let ledger = self.entries(workbook)?;
        let record = ledger
            .deletions
            .iter()
            .find(|d| &d.undo_token == token)
            .ok_or_else(|| unavailable(token))?;

        let tracker = ledger.tracker_after(record.seq);
        let slot = tracker.restore_slot(&record.sheet, 0, record.row);
        let count = port.row_count(session, &record.sheet)?;
        if slot > count + 1 {
            // The sheet lost rows the journal never saw
            return Err(ScheduleError::OffsetDesync {
                sheet: record.sheet.clone(),
                expected_row: slot,
                expected: format!("at least {} rows", slot - 1),
                found: format!("{} rows", count),
            });
        }

        port.insert_row(
            session,
            &record.sheet,
            slot,
            &record.snapshot.values(),
            &FormattingSource::Explicit(record.snapshot.formats()),
        )?;
        let restored = port.read_row(session, &record.sheet, slot)?.trimmed();
        if restored != record.snapshot.clone().trimmed() {
            return Err(ScheduleError::partial_write(
                &record.sheet,
                slot,
                "restored row differs from the deleted snapshot",
            ));
        }

        let change = LedgerChange {
            mutations: vec![Mutation {
                sheet: record.sheet.clone(),
                op: MutationOp::Insert,
                row: slot,
            }],
            consumed: vec![token.clone()],
            ..LedgerChange::default()
        };
        Ok((RowAddress::new(&record.sheet, slot), change))
    }

    /// Remove a committed order row, provided it is still exactly as written
    pub fn revert_write(
        &self,
        port: &dyn DocumentPort,
        session: SessionId,
        workbook: &Path,
        token: &UndoToken,
    ) -> ScheduleResult<(RowAddress, LedgerChange)> {
        let ledger = self.entries(workbook)?;
        let record = ledger
            .writes
            .iter()
            .find(|w| &w.token == token)
            .ok_or_else(|| unavailable(token))?;

        let tracker = ledger.tracker_after(record.seq);
        let row = tracker
            .resolve(&record.sheet, record.row)
            .ok_or_else(|| unavailable(token))?;
        let current = port.read_row(session, &record.sheet, row)?;
        if !current.same_values(&record.snapshot) {
            return Err(ScheduleError::OffsetDesync {
                sheet: record.sheet.clone(),
                expected_row: row,
                expected: record.record.to_string(),
                found: "row content changed since it was written".to_string(),
            });
        }
        port.delete_row(session, &record.sheet, row)?;

        let change = LedgerChange {
            mutations: vec![Mutation {
                sheet: record.sheet.clone(),
                op: MutationOp::Delete,
                row,
            }],
            consumed: vec![token.clone()],
            ..LedgerChange::default()
        };
        Ok((RowAddress::new(&record.sheet, row), change))
    }

    /// Put back the cells an in-place edit overwrote, provided they still hold what the
    /// edit wrote
    pub fn revert_modification(
        &self,
        port: &dyn DocumentPort,
        session: SessionId,
        workbook: &Path,
        token: &UndoToken,
    ) -> ScheduleResult<(RowAddress, LedgerChange)> {
        let ledger = self.entries(workbook)?;
        let record = ledger
            .modifications
            .iter()
            .find(|m| &m.token == token)
            .ok_or_else(|| unavailable(token))?;

        let row = ledger
            .tracker_from(record.since)
            .resolve(&record.sheet, record.row)
            .ok_or_else(|| unavailable(token))?;
        let current = port.read_row(session, &record.sheet, row)?;
        if let Some(edit) = record.cells.iter().find(|e| !current.value(e.column).same_as(&e.after)) {
            return Err(ScheduleError::OffsetDesync {
                sheet: record.sheet.clone(),
                expected_row: row,
                expected: edit.after.as_text(),
                found: current.value(edit.column).as_text(),
            });
        }

        let cells: Vec<(u16, CellValue)> = record
            .cells
            .iter()
            .map(|e| (e.column, e.before.clone()))
            .collect();
        port.write_cells(session, &record.sheet, row, &cells)?;
        let written = port.read_row(session, &record.sheet, row)?;
        if cells.iter().any(|(col, value)| !written.value(*col).same_as(value)) {
            return Err(ScheduleError::partial_write(
                &record.sheet,
                row,
                "reverted cells differ from the values before the edit",
            ));
        }

        let change = LedgerChange {
            consumed: vec![token.clone()],
            ..LedgerChange::default()
        };
        Ok((RowAddress::new(&record.sheet, row), change))
    }

    //--------------------------------------------------------------------------
    // Commit phase
    //--------------------------------------------------------------------------

    /// Persist `change` for `workbook`. Returns what [`restore`](Self::restore) needs to
    /// take it back.
    pub fn commit(&self, workbook: &Path, change: LedgerChange) -> ScheduleResult<LedgerRollback> {
        let workbook_key = key(workbook);
        let now = self.clock.now();
        let mutations = change.mutations.len();
        let mut change = Some(change);

        let rollback = transact(self.store.as_ref(), |state: &mut LedgerState| {
            let rollback = LedgerRollback {
                workbook: workbook_key.clone(),
                before: state.workbooks.get(&workbook_key).cloned(),
            };
            let Some(change) = change.take().filter(|c| !c.is_empty()) else {
                return Ok((false, rollback));
            };
            let ledger = state.workbooks.entry(workbook_key.clone()).or_default();
            self.apply(ledger, change, now);
            Ok((true, rollback))
        })?;
        info!(workbook = %workbook.display(), mutations, "ledger committed");
        Ok(rollback)
    }

    fn apply(&self, ledger: &mut WorkbookLedger, change: LedgerChange, now: Timestamp) {
        let base = ledger.next_seq;
        for (i, mutation) in change.mutations.iter().enumerate() {
            ledger.journal.push(JournalEntry {
                seq: base + i as u64,
                mutation: mutation.clone(),
            });
        }
        ledger.next_seq = base + change.mutations.len() as u64;

        for token in &change.consumed {
            ledger.remove(token);
        }

        for d in change.deletions {
            ledger.deletions.push(DeletionRecord {
                undo_token: d.undo_token,
                sheet: d.sheet,
                logical_row: d.logical_row,
                row: d.row,
                snapshot: d.snapshot,
                timestamp: now,
                seq: base + d.mutation_index as u64,
            });
        }
        for w in change.writes {
            ledger.writes.push(WriteRecord {
                token: w.token,
                record: w.record,
                sheet: w.sheet,
                row: w.row,
                snapshot: w.snapshot,
                timestamp: now,
                seq: base + w.mutation_index as u64,
            });
        }
        for m in change.modifications {
            ledger.modifications.push(ModificationRecord {
                token: m.token,
                record: m.record,
                sheet: m.sheet,
                row: m.row,
                cells: m.cells,
                timestamp: now,
                since: base + m.mutations_before as u64,
            });
        }

        evict_oldest(&mut ledger.deletions, self.config.max_deletions, |d| d.seq);
        evict_oldest(&mut ledger.writes, self.config.max_writes, |w| w.seq);
        evict_oldest(&mut ledger.modifications, self.config.max_writes, |m| m.since);
        ledger.prune();
    }

    /// Take back a commit. Only the committed workbook's entry changes.
    pub fn restore(&self, rollback: &LedgerRollback) -> ScheduleResult<()> {
        self.store.update(&mut |state: &mut LedgerState| {
            match &rollback.before {
                Some(before) => {
                    state
                        .workbooks
                        .insert(rollback.workbook.clone(), before.clone());
                }
                None => {
                    state.workbooks.remove(&rollback.workbook);
                }
            }
            Ok(true)
        })?;
        debug!(workbook = %rollback.workbook, "ledger commit rolled back");
        Ok(())
    }

    /// Drop a record without touching the workbook
    pub fn evict(&self, token: &UndoToken) -> ScheduleResult<()> {
        let found = transact(self.store.as_ref(), |state: &mut LedgerState| {
            let mut found = false;
            for ledger in state.workbooks.values_mut() {
                if ledger.remove(token) {
                    found = true;
                    ledger.prune();
                }
            }
            Ok((found, found))
        })?;
        if !found {
            return Err(unavailable(token));
        }
        info!(token = %token, "ledger entry evicted");
        Ok(())
    }
}

fn key(workbook: &Path) -> String {
    workbook.to_string_lossy().into_owned()
}

fn unavailable(token: &UndoToken) -> ScheduleError {
    ScheduleError::UndoUnavailable {
        token: token.to_string(),
    }
}

fn evict_oldest<T>(records: &mut Vec<T>, cap: usize, seq: impl Fn(&T) -> u64) {
    if records.len() <= cap {
        return;
    }
    records.sort_by_key(|r| seq(r));
    let excess = records.len() - cap;
    records.drain(..excess);
}
