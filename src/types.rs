use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::identifier;

//==============================================================================
// Identifiers
//==============================================================================

/// Reference to an order record (stable across retries).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordRef(pub String);

impl RecordRef {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token addressing one ledger entry (deletion, committed write or in-place edit).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UndoToken(pub String);

impl UndoToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for UndoToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//==============================================================================
// Cells and rows
//==============================================================================

/// A single cell value as the document port sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
    /// Formula text including the leading `=`
    Formula(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Text form used for identifier comparison and display.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Formula(f) => f.clone(),
        }
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, CellValue::Formula(_))
    }

    /// Equal, treating every kind of blank as the same value
    pub fn same_as(&self, other: &CellValue) -> bool {
        self == other || (self.is_empty() && other.is_empty())
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(d: NaiveDate) -> Self {
        CellValue::Date(d)
    }
}

/// Cell formatting carried between rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CellFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
    /// Fill colour as 0xRRGGBB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_color: Option<u32>,
    #[serde(default)]
    pub bold: bool,
}

impl CellFormat {
    pub fn is_default(&self) -> bool {
        *self == CellFormat::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cell {
    pub value: CellValue,
    #[serde(default)]
    pub format: CellFormat,
}

impl Cell {
    pub fn new(value: CellValue) -> Self {
        Self {
            value,
            format: CellFormat::default(),
        }
    }
}

/// Full content of one row: values and formatting, column A first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowSnapshot {
    pub cells: Vec<Cell>,
}

impl RowSnapshot {
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<CellValue>,
    {
        Self {
            cells: values.into_iter().map(|v| Cell::new(v.into())).collect(),
        }
    }

    pub fn value(&self, col: u16) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.cells
            .get(col as usize)
            .map(|c| &c.value)
            .unwrap_or(&EMPTY)
    }

    pub fn values(&self) -> Vec<CellValue> {
        self.cells.iter().map(|c| c.value.clone()).collect()
    }

    pub fn formats(&self) -> Vec<CellFormat> {
        self.cells.iter().map(|c| c.format.clone()).collect()
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.value.is_empty())
    }

    /// Same values as `other`, ignoring formatting. Formula cells only need to be formulas
    /// on both sides, since structural edits elsewhere re-address them.
    pub fn same_values(&self, other: &RowSnapshot) -> bool {
        let width = self.cells.len().max(other.cells.len());
        (0..width).all(|col| {
            let (a, b) = (self.value(col as u16), other.value(col as u16));
            match (a, b) {
                (CellValue::Formula(_), CellValue::Formula(_)) => true,
                _ => a == b || (a.is_empty() && b.is_empty()),
            }
        })
    }

    /// Drop trailing empty, unformatted cells so snapshots compare by content.
    pub fn trimmed(mut self) -> Self {
        while let Some(last) = self.cells.last() {
            if last.value.is_empty() && last.format.is_default() {
                self.cells.pop();
            } else {
                break;
            }
        }
        self
    }
}

//==============================================================================
// Order records
//==============================================================================

/// What an order record does to the workbook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderOperation {
    /// Insert a new row next to a reference row
    #[default]
    New,
    /// Overwrite mapped fields of the order's existing row, keeping its formatting
    Modify,
    /// Archive the order's existing row to the cancellation sheet, then delete it
    Cancel,
}

impl fmt::Display for OrderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderOperation::New => "new",
            OrderOperation::Modify => "modify",
            OrderOperation::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Order line produced by the external parser. Immutable once handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(default = "RecordRef::generate")]
    pub id: RecordRef,
    pub sku: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    /// Combined SKU-SPEC (e.g. `92105-S001`); derived from sku/spec when absent
    #[serde(default)]
    pub sku_spec: String,
    /// Restrict matching to a named sheet (exact, then containment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_sheet: Option<String>,
    /// Business field name (or column letter) → value
    #[serde(default)]
    pub fields: BTreeMap<String, CellValue>,
    #[serde(default)]
    pub operation: OrderOperation,
    /// Existing row of a modify or cancel, in `target_sheet` and in the numbering at the
    /// start of the call. Without it the row is found by exact SKU-SPEC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u32>,
}

impl OrderRecord {
    pub fn new(sku: impl Into<String>, spec: Option<&str>) -> Self {
        let sku = sku.into();
        let sku_spec = identifier::combine(&sku, spec);
        Self {
            id: RecordRef::generate(),
            sku,
            spec: spec.map(str::to_string),
            sku_spec,
            target_sheet: None,
            fields: BTreeMap::new(),
            operation: OrderOperation::New,
            row: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = RecordRef(id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_target_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.target_sheet = Some(sheet.into());
        self
    }

    pub fn with_operation(mut self, operation: OrderOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Address the existing row directly instead of searching for it
    pub fn at_row(mut self, sheet: impl Into<String>, row: u32) -> Self {
        self.target_sheet = Some(sheet.into());
        self.row = Some(row);
        self
    }

    /// Fill `sku_spec` from sku/spec if the source left it blank.
    pub fn normalized(mut self) -> Self {
        if self.sku_spec.trim().is_empty() {
            self.sku_spec = identifier::combine(&self.sku, self.spec.as_deref());
        }
        self
    }
}

//==============================================================================
// Results
//==============================================================================

/// Matching tier that selected a reference row (lower is stronger)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ExactSkuSpec,
    BaseSku,
    Prefix,
    /// Target sheet found but no row matched; its last data row is the template
    LastDataRow,
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchTier::ExactSkuSpec => "exact sku-spec",
            MatchTier::BaseSku => "base sku",
            MatchTier::Prefix => "prefix",
            MatchTier::LastDataRow => "last data row",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Per-record result of a batch or retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub record: RecordRef,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_sheet: Option<String>,
    /// Physical row the new line was written to, or the row edited or cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_row: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<MatchTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error kind label for failures (`no_match_found`, `partial_write`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Ledger token of the committed write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_token: Option<UndoToken>,
    /// Ledger token of a cancellation or in-place edit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_token: Option<UndoToken>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl BatchResult {
    pub fn success(record: RecordRef, sheet: impl Into<String>, row: u32, tier: MatchTier) -> Self {
        Self {
            record,
            outcome: Outcome::Success,
            matched_sheet: Some(sheet.into()),
            matched_row: Some(row),
            tier: Some(tier),
            reason: None,
            error_kind: None,
            write_token: None,
            undo_token: None,
            warnings: Vec::new(),
        }
    }

    pub fn failure(record: RecordRef, error: &crate::error::ScheduleError) -> Self {
        Self {
            record,
            outcome: Outcome::Failure,
            matched_sheet: None,
            matched_row: None,
            tier: None,
            reason: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            write_token: None,
            undo_token: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// A `(sheet, row)` pair addressing a row in the numbering at the start of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowAddress {
    pub sheet: String,
    pub row: u32,
}

impl RowAddress {
    pub fn new(sheet: impl Into<String>, row: u32) -> Self {
        Self {
            sheet: sheet.into(),
            row,
        }
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.row)
    }
}

/// Timestamp type used across ledger and retry state
pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_record_combines_sku_spec() {
        let record = OrderRecord::new("92105", Some("S001"));
        assert_eq!(record.sku_spec, "92105-S001");

        let bare = OrderRecord::new("92105", None);
        assert_eq!(bare.sku_spec, "92105");
    }

    #[test]
    fn test_order_record_normalized_fills_blank_sku_spec() {
        let json = r#"{"id": "po-1", "sku": "9296", "spec": "S001"}"#;
        let record: OrderRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.sku_spec, "");
        let record = record.normalized();
        assert_eq!(record.sku_spec, "9296-S001");
        assert_eq!(record.id, RecordRef("po-1".to_string()));
    }

    #[test]
    fn test_cell_value_as_text() {
        assert_eq!(CellValue::Number(1200.0).as_text(), "1200");
        assert_eq!(CellValue::Number(1.5).as_text(), "1.5");
        assert_eq!(
            CellValue::Date(NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()).as_text(),
            "2025-03-09"
        );
        assert!(CellValue::Text("  ".into()).is_empty());
    }

    #[test]
    fn test_snapshot_trimmed_drops_trailing_blanks() {
        let mut snap = RowSnapshot::from_values(["a", "b", ""]);
        snap.cells.push(Cell::default());
        let trimmed = snap.trimmed();
        assert_eq!(trimmed.cells.len(), 2);
    }

    #[test]
    fn test_same_values_ignores_formats_and_formula_text() {
        let mut written = RowSnapshot::from_values(vec![
            CellValue::from("Bear"),
            CellValue::Formula("=B3*2".to_string()),
        ]);
        written.cells[0].format.fill = Some(0xDDEBF7);
        let mut current = RowSnapshot::from_values(vec![
            CellValue::from("Bear"),
            CellValue::Formula("=B4*2".to_string()),
            CellValue::Empty,
        ]);
        assert!(written.same_values(&current));

        current.cells[0].value = CellValue::from("Lion");
        assert!(!written.same_values(&current));
    }

    #[test]
    fn test_cell_value_serde_shape() {
        let json = serde_json::to_string(&CellValue::Number(3.0)).unwrap();
        assert_eq!(json, r#"{"type":"number","value":3.0}"#);
        let back: CellValue = serde_json::from_str(r#"{"type":"empty"}"#).unwrap();
        assert_eq!(back, CellValue::Empty);
    }
}
