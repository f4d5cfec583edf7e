//! Order Source: read order records from a YAML or JSON file
//!
//! ```yaml
//! orders:
//!   - id: PO-4471-1
//!     sku: 92105
//!     spec: S001
//!     target_sheet: Dinosaurs
//!     fields:
//!       qty: 240
//!       ship_date: 2025-05-01
//!       total: "=I2*2"
//!   - sku: 92105
//!     spec: S001
//!     operation: modify
//!     fields:
//!       qty: 300
//!   - sku: 1001
//!     spec: S002
//!     operation: cancel
//!     target_sheet: Dinosaurs
//!     row: 14
//! ```
//!
//! `operation` defaults to `new`. `modify` and `cancel` act on the order's own row: the
//! given `row` of `target_sheet`, or else the single row holding the exact SKU-SPEC.
//!
//! A bare top-level list is accepted too. Field values are typed on the way in: numbers
//! and booleans stay themselves, `YYYY-MM-DD` strings become dates, strings starting with
//! `=` become formulas.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{ScheduleError, ScheduleResult};
use crate::types::{CellValue, OrderOperation, OrderRecord, RecordRef};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OrderFile {
    Wrapped { orders: Vec<RawOrder> },
    List(Vec<RawOrder>),
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    #[serde(default)]
    id: Option<Value>,
    sku: Value,
    #[serde(default)]
    spec: Option<Value>,
    #[serde(default)]
    sku_spec: Option<Value>,
    #[serde(default)]
    target_sheet: Option<String>,
    #[serde(default)]
    operation: OrderOperation,
    #[serde(default)]
    row: Option<u32>,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
}

/// Load and normalize all records from `path`
pub fn load_orders(path: &Path) -> ScheduleResult<Vec<OrderRecord>> {
    let content = fs::read_to_string(path)?;
    parse_orders(&content)
}

pub fn parse_orders(content: &str) -> ScheduleResult<Vec<OrderRecord>> {
    let file: OrderFile = serde_yaml::from_str(content)?;
    let raw = match file {
        OrderFile::Wrapped { orders } => orders,
        OrderFile::List(orders) => orders,
    };
    raw.into_iter()
        .enumerate()
        .map(|(i, order)| convert(i, order))
        .collect()
}

fn convert(index: usize, raw: RawOrder) -> ScheduleResult<OrderRecord> {
    let sku = scalar_text(&raw.sku)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ScheduleError::Config(format!("order #{} has no sku", index + 1)))?;
    let spec = raw.spec.as_ref().and_then(scalar_text);

    let mut record = OrderRecord::new(sku, spec.as_deref());
    if let Some(id) = raw.id.as_ref().and_then(scalar_text) {
        record.id = RecordRef(id);
    }
    if let Some(combined) = raw.sku_spec.as_ref().and_then(scalar_text) {
        record.sku_spec = combined;
    }
    if raw.row == Some(0) {
        return Err(ScheduleError::Config(format!("order #{} has row 0", index + 1)));
    }
    if raw.row.is_some() && raw.target_sheet.is_none() {
        return Err(ScheduleError::Config(format!(
            "order #{} gives a row without target_sheet",
            index + 1
        )));
    }
    record.target_sheet = raw.target_sheet;
    record.row = raw.row;
    record.operation = raw.operation;
    for (name, value) in raw.fields {
        record.fields.insert(name, field_value(&value));
    }
    Ok(record.normalized())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn field_value(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
        Value::String(s) if s.starts_with('=') => CellValue::Formula(s.clone()),
        Value::String(s) => match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
            Ok(date) => CellValue::Date(date),
            Err(_) => CellValue::Text(s.clone()),
        },
        other => CellValue::Text(serde_yaml::to_string(other).unwrap_or_default().trim().to_string()),
    }
}
