//! Batch Processor integration tests against the in-memory port

use pretty_assertions::assert_eq;
use schedule_forge::config::EngineConfig;
use schedule_forge::core::BatchProcessor;
use schedule_forge::port::{DocumentPort, Fault, MemoryPort, SessionId, WorkbookData};
use schedule_forge::{CellValue, MatchTier, OrderRecord, ScheduleError};
use std::collections::BTreeMap;
use std::path::Path;

const PLAN: &str = "plan.xlsx";

/// A: name, G: identifier, I: qty, J: formula on qty
fn row(name: &str, identifier: &str, qty: f64, row_number: u32) -> Vec<CellValue> {
    let mut cells = vec![CellValue::Empty; 10];
    cells[0] = CellValue::Text(name.to_string());
    cells[6] = CellValue::Text(identifier.to_string());
    cells[8] = CellValue::Number(qty);
    cells[9] = CellValue::Formula(format!("=I{}*2", row_number));
    cells
}

fn fixture() -> WorkbookData {
    let header: Vec<CellValue> = ["Name", "", "", "", "", "", "SKU", "", "Qty", "Total"]
        .into_iter()
        .map(CellValue::from)
        .collect();
    WorkbookData::new().with_sheet(
        "Plush",
        vec![
            header,
            row("Bear", "9296-s001", 10.0, 2),
            row("Lion", "1001-S001", 20.0, 3),
            row("Owl", "9999-s002", 30.0, 4),
        ],
    )
}

fn config() -> EngineConfig {
    let mut columns = BTreeMap::new();
    columns.insert("qty".to_string(), "I".to_string());
    EngineConfig {
        identifier_columns: vec!["G".to_string()],
        columns,
        ..EngineConfig::default()
    }
}

fn open() -> (MemoryPort, SessionId) {
    let port = MemoryPort::new().with_workbook(PLAN, fixture());
    let session = port.open(Path::new(PLAN)).unwrap();
    (port, session)
}

fn identifier_at(port: &MemoryPort, session: SessionId, row: u32) -> String {
    port.read_row(session, "Plush", row).unwrap().value(6).as_text()
}

// ═══════════════════════════════════════════════════════════════════════════
// ISOLATION AND PLACEMENT
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_failed_record_does_not_affect_its_neighbours() {
    let (port, session) = open();
    let config = config();
    let records = vec![
        OrderRecord::new("9296", Some("S001")).with_id("r1").with_field("qty", 240.0),
        OrderRecord::new("5555", Some("S001")).with_id("r2"),
        OrderRecord::new("1001", Some("S001")).with_id("r3").with_field("qty", 60.0),
    ];

    let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.writes.len(), 2);
    assert!(report.results[0].is_success());
    assert_eq!(report.results[1].error_kind.as_deref(), Some("no_match_found"));
    assert!(report.results[2].is_success());

    // r1 goes below its reference row; r3 stacks below the last insert in the sheet
    assert_eq!(report.results[0].matched_row, Some(3));
    assert_eq!(report.results[2].matched_row, Some(4));
    assert_eq!(port.row_count(session, "Plush").unwrap(), 6);
    assert_eq!(identifier_at(&port, session, 5), "1001-S001");
    assert_eq!(identifier_at(&port, session, 6), "9999-s002");
}

#[test]
fn test_written_row_copies_reference_and_overwrites_fields() {
    let (port, session) = open();
    let config = config();
    let records = vec![OrderRecord::new("9296", Some("S001")).with_field("qty", 240.0)];

    let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();
    assert_eq!(report.results[0].tier, Some(MatchTier::ExactSkuSpec));

    let written = port.read_row(session, "Plush", 3).unwrap();
    assert_eq!(written.value(0), &CellValue::Text("Bear".to_string()));
    assert_eq!(written.value(8), &CellValue::Number(240.0));
    assert_eq!(written.value(9), &CellValue::Formula("=I3*2".to_string()));
    // The reference row itself is untouched
    assert_eq!(port.read_row(session, "Plush", 2).unwrap().value(8), &CellValue::Number(10.0));
}

#[test]
fn test_identifier_keeps_reference_casing() {
    let (port, session) = open();
    let config = config();
    let records = vec![OrderRecord::new("9296", Some("S001"))];

    BatchProcessor::new(&port, session, &config).run(&records).unwrap();
    assert_eq!(identifier_at(&port, session, 3), "9296-s001");
}

#[test]
fn test_identifier_written_verbatim_when_reference_differs() {
    let (port, session) = open();
    let config = config();
    // Matches the 9999-s002 row on its base SKU only
    let records = vec![OrderRecord::new("9999", Some("S001"))];

    let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();
    assert_eq!(report.results[0].tier, Some(MatchTier::BaseSku));
    assert_eq!(identifier_at(&port, session, 5), "9999-S001");
}

#[test]
fn test_unmapped_field_is_a_warning() {
    let (port, session) = open();
    let config = config();
    let records = vec![OrderRecord::new("9296", Some("S001")).with_field("po number", "PO-1")];

    let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();
    assert!(report.results[0].is_success());
    assert_eq!(
        report.results[0].warnings,
        vec!["field 'po number' has no column mapping".to_string()]
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// FAILURES
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_partial_write_is_removed_and_batch_continues() {
    let (port, session) = open();
    port.inject(Fault::PartialInsert { after: 0 });
    let config = config();
    let records = vec![
        OrderRecord::new("9296", Some("S001")).with_id("r1"),
        OrderRecord::new("1001", Some("S001")).with_id("r2"),
    ];

    let report = BatchProcessor::new(&port, session, &config).run(&records).unwrap();

    assert_eq!(report.results[0].error_kind.as_deref(), Some("partial_write"));
    assert!(report.results[1].is_success());
    assert!(report.suspect_rows.is_empty());
    // Only r2's row remains: 4 original rows + 1
    assert_eq!(port.row_count(session, "Plush").unwrap(), 5);
    assert_eq!(identifier_at(&port, session, 3), "1001-S001");
    assert_eq!(identifier_at(&port, session, 4), "1001-S001");
    assert_eq!(report.writes.len(), 1);
    assert_eq!(report.writes[0].row, 4);
}

#[test]
fn test_lost_session_aborts_the_batch() {
    let (port, session) = open();
    port.inject(Fault::LockedOnInsert { after: 1 });
    let config = config();
    let records = vec![
        OrderRecord::new("9296", Some("S001")),
        OrderRecord::new("1001", Some("S001")),
    ];

    let err = BatchProcessor::new(&port, session, &config).run(&records).unwrap_err();
    assert!(matches!(err, ScheduleError::DocumentLock { .. }));
}
