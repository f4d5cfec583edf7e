//! Schedule Forge - batch writer for production-schedule workbooks
//!
//! Takes order records (SKU, spec, business fields) and writes each one as a new row
//! next to the best-matching reference row of a multi-sheet workbook, keeping row
//! numbers consistent while rows shift under it.
//!
//! # Features
//!
//! - Three-tier reference matching (exact SKU-SPEC, base SKU, bounded prefix)
//! - Per-sheet offset tracking across inserts and deletes within one call
//! - Case-preserving identifier writes, formula row shifting, format carry-over
//! - Modify and cancel operations on existing order rows; cancelled rows are archived
//! - Undoable deletions, edits and committed writes (persistent ledger)
//! - Failed records queued for manual or scheduled retry
//!
//! # Example
//!
//! ```no_run
//! use schedule_forge::{EngineConfig, OrderRecord, ScheduleEngine};
//! use schedule_forge::port::XlsxPort;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn demo() -> schedule_forge::ScheduleResult<()> {
//! let engine = ScheduleEngine::new(EngineConfig::default(), Arc::new(XlsxPort::new()))?;
//! let record = OrderRecord::new("92105", Some("S001")).with_field("I", 240.0);
//! let summary = engine.run_batch(Path::new("plan.xlsx"), vec![record]).await?;
//! println!("written: {}", summary.results.iter().filter(|r| r.is_success()).count());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod clock;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod formula;
pub mod identifier;
pub mod orders;
pub mod port;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{BatchSummary, ScheduleEngine};
pub use error::{ScheduleError, ScheduleResult};
pub use types::{
    BatchResult, CellValue, MatchTier, OrderOperation, OrderRecord, RecordRef, RowAddress, UndoToken,
};
