//! CLI command handlers

pub mod commands;

pub use commands::{
    batch, cancel, delete, evict, find, ledger, parse_row_address, parse_when, retries, retry,
    revert, schedule, tick, undo,
};
