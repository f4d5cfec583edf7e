//! Deletion Ledger integration tests: delete, undo, eviction, persistence

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use schedule_forge::clock::ManualClock;
use schedule_forge::config::LedgerConfig;
use schedule_forge::core::{DeletionLedger, LedgerChange, LedgerState, Mutation, MutationOp};
use schedule_forge::port::{DocumentPort, FormattingSource, MemoryPort, WorkbookData};
use schedule_forge::store::{JsonFileStore, MemoryStore, StateStore};
use schedule_forge::{CellValue, RowAddress, ScheduleError, UndoToken};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PLAN: &str = "plan.xlsx";

fn fixture(rows: u32) -> WorkbookData {
    WorkbookData::new().with_sheet(
        "Plush",
        (1..=rows).map(|n| vec![format!("row {}", n), format!("{}-S001", 9000 + n)]),
    )
}

fn ledger_with(store: Arc<dyn StateStore<LedgerState>>, config: LedgerConfig) -> DeletionLedger {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()));
    DeletionLedger::new(store, clock, config)
}

fn ledger() -> DeletionLedger {
    ledger_with(Arc::new(MemoryStore::<LedgerState>::new()), LedgerConfig::default())
}

/// Delete rows in their own session and commit, as the engine does
fn delete(port: &MemoryPort, ledger: &DeletionLedger, entries: &[RowAddress]) -> Vec<UndoToken> {
    let session = port.open(Path::new(PLAN)).unwrap();
    let change = ledger.delete(port, session, entries).unwrap();
    let tokens = change.deletions.iter().map(|d| d.undo_token.clone()).collect();
    ledger.commit(Path::new(PLAN), change).unwrap();
    port.save(session).unwrap();
    port.close(session).unwrap();
    tokens
}

fn undo(port: &MemoryPort, ledger: &DeletionLedger, token: &UndoToken) -> Result<RowAddress, ScheduleError> {
    let session = port.open(Path::new(PLAN)).unwrap();
    let outcome = ledger.undo(port, session, Path::new(PLAN), token).and_then(|(address, change)| {
        ledger.commit(Path::new(PLAN), change)?;
        port.save(session)?;
        Ok(address)
    });
    port.close(session).unwrap();
    outcome
}

fn first_cell(port: &MemoryPort, row: u32) -> String {
    let data = port.workbook(Path::new(PLAN)).unwrap();
    data.sheet("Plush").unwrap().read(row).unwrap().value(0).as_text()
}

// ═══════════════════════════════════════════════════════════════════════════
// ROUND TRIP
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_undo_accounts_for_an_intervening_insert() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(10));
    let ledger = ledger();
    let before = port.workbook(Path::new(PLAN)).unwrap().sheet("Plush").unwrap().read(5).unwrap();

    let tokens = delete(&port, &ledger, &[RowAddress::new("Plush", 5)]);
    assert_eq!(first_cell(&port, 5), "row 6");

    // Unrelated insert above the deleted row, in a later call
    let session = port.open(Path::new(PLAN)).unwrap();
    port.insert_row(session, "Plush", 2, &[CellValue::from("new")], &FormattingSource::None)
        .unwrap();
    let change = LedgerChange {
        mutations: vec![Mutation {
            sheet: "Plush".to_string(),
            op: MutationOp::Insert,
            row: 2,
        }],
        ..LedgerChange::default()
    };
    ledger.commit(Path::new(PLAN), change).unwrap();
    port.save(session).unwrap();
    port.close(session).unwrap();

    let restored = undo(&port, &ledger, &tokens[0]).unwrap();
    assert_eq!(restored, RowAddress::new("Plush", 6));

    let data = port.workbook(Path::new(PLAN)).unwrap();
    let sheet = data.sheet("Plush").unwrap();
    assert_eq!(sheet.read(6).unwrap().trimmed(), before.trimmed());
    assert_eq!(first_cell(&port, 5), "row 4");
    assert_eq!(first_cell(&port, 7), "row 6");
    assert_eq!(sheet.row_count(), 11);
}

#[test]
fn test_entries_are_addressed_in_numbering_before_the_call() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(6));
    let ledger = ledger();

    delete(
        &port,
        &ledger,
        &[RowAddress::new("Plush", 2), RowAddress::new("Plush", 4)],
    );

    let remaining: Vec<String> = (1..=4).map(|r| first_cell(&port, r)).collect();
    assert_eq!(remaining, vec!["row 1", "row 3", "row 5", "row 6"]);
}

#[test]
fn test_undo_in_reverse_order_restores_original_layout() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(6));
    let ledger = ledger();
    let original = port.workbook(Path::new(PLAN)).unwrap();

    let tokens = delete(
        &port,
        &ledger,
        &[RowAddress::new("Plush", 2), RowAddress::new("Plush", 4)],
    );
    undo(&port, &ledger, &tokens[1]).unwrap();
    undo(&port, &ledger, &tokens[0]).unwrap();

    assert_eq!(port.workbook(Path::new(PLAN)).unwrap(), original);
}

#[test]
fn test_same_row_twice_in_one_call_is_invalid() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(4));
    let ledger = ledger();
    let session = port.open(Path::new(PLAN)).unwrap();

    let err = ledger
        .delete(
            &port,
            session,
            &[RowAddress::new("Plush", 2), RowAddress::new("Plush", 2)],
        )
        .unwrap_err();
    assert!(matches!(err, ScheduleError::InvalidRow { row: 2, .. }));
}

// ═══════════════════════════════════════════════════════════════════════════
// UNAVAILABLE TOKENS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_token_is_consumed_by_undo() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(4));
    let ledger = ledger();
    let tokens = delete(&port, &ledger, &[RowAddress::new("Plush", 3)]);

    undo(&port, &ledger, &tokens[0]).unwrap();
    let err = undo(&port, &ledger, &tokens[0]).unwrap_err();
    assert!(matches!(err, ScheduleError::UndoUnavailable { .. }));
    assert!(ledger.entries(Path::new(PLAN)).unwrap().journal.is_empty());
}

#[test]
fn test_evicted_entry_cannot_be_undone() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(4));
    let ledger = ledger();
    let tokens = delete(&port, &ledger, &[RowAddress::new("Plush", 3)]);

    ledger.evict(&tokens[0]).unwrap();
    let err = undo(&port, &ledger, &tokens[0]).unwrap_err();
    assert!(matches!(err, ScheduleError::UndoUnavailable { .. }));
    assert!(matches!(ledger.evict(&tokens[0]), Err(ScheduleError::UndoUnavailable { .. })));
}

#[test]
fn test_oldest_deletions_are_evicted_over_capacity() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(8));
    let ledger = ledger_with(
        Arc::new(MemoryStore::<LedgerState>::new()),
        LedgerConfig {
            max_deletions: 2,
            ..LedgerConfig::default()
        },
    );

    let first = delete(&port, &ledger, &[RowAddress::new("Plush", 2)]);
    let second = delete(&port, &ledger, &[RowAddress::new("Plush", 2)]);
    let third = delete(&port, &ledger, &[RowAddress::new("Plush", 2)]);

    let kept: Vec<UndoToken> = ledger
        .entries(Path::new(PLAN))
        .unwrap()
        .deletions
        .into_iter()
        .map(|d| d.undo_token)
        .collect();
    assert_eq!(kept, vec![second[0].clone(), third[0].clone()]);
    assert!(matches!(
        undo(&port, &ledger, &first[0]),
        Err(ScheduleError::UndoUnavailable { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════════
// PERSISTENCE
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_undo_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.json");
    let port = MemoryPort::new().with_workbook(PLAN, fixture(5));

    let tokens = {
        let ledger = ledger_with(Arc::new(JsonFileStore::new(&path)), LedgerConfig::default());
        delete(&port, &ledger, &[RowAddress::new("Plush", 3)])
    };
    assert!(path.exists());

    let ledger = ledger_with(Arc::new(JsonFileStore::new(&path)), LedgerConfig::default());
    let restored = undo(&port, &ledger, &tokens[0]).unwrap();
    assert_eq!(restored, RowAddress::new("Plush", 3));
    assert_eq!(first_cell(&port, 3), "row 3");
}

#[test]
fn test_restore_puts_back_previous_state() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(4));
    let ledger = ledger();
    let session = port.open(Path::new(PLAN)).unwrap();
    let change = ledger.delete(&port, session, &[RowAddress::new("Plush", 2)]).unwrap();

    let previous = ledger.commit(Path::new(PLAN), change).unwrap();
    assert_eq!(ledger.entries(Path::new(PLAN)).unwrap().deletions.len(), 1);

    ledger.restore(&previous).unwrap();
    assert_eq!(ledger.state().unwrap(), LedgerState::default());
    port.close(session).unwrap();
}

#[test]
fn test_restore_leaves_other_workbooks_alone() {
    const OTHER: &str = "other.xlsx";
    let port = MemoryPort::new()
        .with_workbook(PLAN, fixture(4))
        .with_workbook(OTHER, fixture(4));
    let ledger = ledger();

    let plan = port.open(Path::new(PLAN)).unwrap();
    let plan_change = ledger.delete(&port, plan, &[RowAddress::new("Plush", 2)]).unwrap();
    let other = port.open(Path::new(OTHER)).unwrap();
    let other_change = ledger.delete(&port, other, &[RowAddress::new("Plush", 3)]).unwrap();

    // Both commits land before the first one is taken back
    let plan_rollback = ledger.commit(Path::new(PLAN), plan_change).unwrap();
    ledger.commit(Path::new(OTHER), other_change).unwrap();
    ledger.restore(&plan_rollback).unwrap();

    assert!(ledger.entries(Path::new(PLAN)).unwrap().deletions.is_empty());
    assert_eq!(ledger.entries(Path::new(OTHER)).unwrap().deletions.len(), 1);
    port.close(plan).unwrap();
    port.close(other).unwrap();
}

#[test]
fn test_undo_into_a_sheet_shrunk_outside_the_ledger_is_desync() {
    let port = MemoryPort::new().with_workbook(PLAN, fixture(10));
    let ledger = ledger();
    let tokens = delete(&port, &ledger, &[RowAddress::new("Plush", 8)]);

    // Rows removed by hand; the journal never hears of it
    let session = port.open(Path::new(PLAN)).unwrap();
    for _ in 0..5 {
        port.delete_row(session, "Plush", 1).unwrap();
    }
    port.save(session).unwrap();
    port.close(session).unwrap();

    let err = undo(&port, &ledger, &tokens[0]).unwrap_err();
    assert!(matches!(err, ScheduleError::OffsetDesync { expected_row: 8, .. }));
    // Nothing was inserted and the token is still there
    assert_eq!(
        port.workbook(Path::new(PLAN)).unwrap().sheet("Plush").unwrap().row_count(),
        4
    );
    assert_eq!(ledger.entries(Path::new(PLAN)).unwrap().deletions.len(), 1);
}
