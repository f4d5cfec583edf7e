//! Batch-mutation core: matching, offset bookkeeping, writing, undo and retry

pub mod batch;
pub mod ledger;
pub mod matcher;
pub mod offset;
pub mod retry;
pub mod writer;

pub use batch::{BatchProcessor, BatchReport, CommittedWrite};
pub use ledger::{
    CellEdit, DeletionLedger, DeletionRecord, LedgerChange, LedgerEntry, LedgerRollback, LedgerState,
    ModificationRecord, PendingDeletion, PendingModification, WriteRecord,
};
pub use matcher::{ReferenceMatch, ReferenceMatcher, WorkbookIndex};
pub use offset::{DeletionMark, InsertionMark, Mutation, MutationOp, OffsetTracker};
pub use retry::{PendingRetry, RetryQueue, RetryScheduler, RetryStatus};
pub use writer::CellWriter;
