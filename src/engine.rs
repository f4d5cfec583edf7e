//! Schedule engine: per-workbook serialization, session lifecycle and wiring
//!
//! Every operation against a workbook takes that workbook's lock (bounded by
//! `lock_timeout`), then runs its document work on a blocking thread bounded by
//! `operation_timeout`. The session is always closed; it is saved only after the ledger
//! has recorded the change. A timed-out operation is reported as `DocumentLock` and its
//! worker will not save when it eventually finishes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::core::{
    BatchProcessor, DeletionLedger, LedgerChange, LedgerEntry, LedgerState, PendingRetry,
    ReferenceMatch, ReferenceMatcher, RetryQueue, RetryScheduler, WorkbookIndex,
};
use crate::core::ledger::WorkbookLedger;
use crate::error::{ScheduleError, ScheduleResult};
use crate::port::{DocumentPort, SessionId};
use crate::store::{JsonFileStore, MemoryStore, StateStore};
use crate::types::{BatchResult, OrderRecord, RowAddress, Timestamp, UndoToken};

/// Result of a batch call
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// One per input record, in input order
    pub results: Vec<BatchResult>,
    pub suspect_rows: Vec<RowAddress>,
    /// Retry items created for the failed records
    pub queued: Vec<PendingRetry>,
}

/// Async locks keyed by workbook path
#[derive(Debug, Default)]
struct WorkbookLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkbookLocks {
    async fn acquire(&self, path: &Path, timeout: Duration) -> ScheduleResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(path.to_path_buf()).or_default().clone()
        };
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                ScheduleError::document_lock(
                    path,
                    format!("another operation held the workbook for more than {:?}", timeout),
                )
            })
    }
}

/// Session work handed to the blocking pool
type SessionWork<T> =
    Box<dyn FnOnce(&dyn DocumentPort, SessionId, &AtomicBool) -> ScheduleResult<T> + Send + 'static>;

pub struct ScheduleEngine {
    config: Arc<EngineConfig>,
    port: Arc<dyn DocumentPort>,
    ledger: Arc<DeletionLedger>,
    retries: Arc<RetryScheduler>,
    locks: WorkbookLocks,
    tick_gate: tokio::sync::Mutex<()>,
    lock_timeout: Duration,
    operation_timeout: Duration,
}

impl ScheduleEngine {
    /// Engine with file-backed state under `config.data_dir` and the system clock.
    ///
    /// Retries left running by an interrupted process go back to the queue.
    pub fn new(config: EngineConfig, port: Arc<dyn DocumentPort>) -> ScheduleResult<Self> {
        config.validate()?;
        let ledger_store: Arc<dyn StateStore<LedgerState>> =
            Arc::new(JsonFileStore::new(config.ledger_path()));
        let retry_store: Arc<dyn StateStore<RetryQueue>> =
            Arc::new(JsonFileStore::new(config.retries_path()));
        let engine = Self::with_parts(config, port, Arc::new(SystemClock), ledger_store, retry_store);
        engine.retries.recover()?;
        Ok(engine)
    }

    /// Engine with process-local state, for tests and dry runs
    pub fn in_memory(config: EngineConfig, port: Arc<dyn DocumentPort>, clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(
            config,
            port,
            clock,
            Arc::new(MemoryStore::<LedgerState>::new()),
            Arc::new(MemoryStore::<RetryQueue>::new()),
        )
    }

    pub fn with_parts(
        config: EngineConfig,
        port: Arc<dyn DocumentPort>,
        clock: Arc<dyn Clock>,
        ledger_store: Arc<dyn StateStore<LedgerState>>,
        retry_store: Arc<dyn StateStore<RetryQueue>>,
    ) -> Self {
        let ledger = DeletionLedger::new(ledger_store, clock.clone(), config.ledger.clone());
        let retries = RetryScheduler::new(retry_store, clock, config.retry.clone());
        Self {
            lock_timeout: config.lock_timeout(),
            operation_timeout: config.operation_timeout(),
            config: Arc::new(config),
            port,
            ledger: Arc::new(ledger),
            retries: Arc::new(retries),
            locks: WorkbookLocks::default(),
            tick_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the configured timeouts
    pub fn with_timeouts(mut self, lock: Duration, operation: Duration) -> Self {
        self.lock_timeout = lock;
        self.operation_timeout = operation;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &DeletionLedger {
        &self.ledger
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.retries
    }

    //==========================================================================
    // Batch and search
    //==========================================================================

    /// Write `records` into `workbook`. Failed records are queued for retry.
    ///
    /// A fatal error discards the whole call; every record is then queued and the error
    /// is returned.
    pub async fn run_batch(
        &self,
        workbook: &Path,
        records: Vec<OrderRecord>,
    ) -> ScheduleResult<BatchSummary> {
        let records: Vec<OrderRecord> = records.into_iter().map(OrderRecord::normalized).collect();
        match self.process_records(workbook, records.clone()).await {
            Ok((results, suspect_rows)) => {
                let failures: Vec<(OrderRecord, String)> = records
                    .into_iter()
                    .zip(results.iter())
                    .filter(|(_, r)| !r.is_success())
                    .map(|(rec, r)| (rec, r.reason.clone().unwrap_or_default()))
                    .collect();
                let queued = self.retries.enqueue(workbook, failures, 1)?;
                Ok(BatchSummary {
                    results,
                    suspect_rows,
                    queued,
                })
            }
            Err(e) => {
                warn!(workbook = %workbook.display(), error = %e, "batch aborted");
                let reason = e.to_string();
                let all = records.into_iter().map(|r| (r, reason.clone())).collect();
                self.retries.enqueue(workbook, all, 1)?;
                Err(e)
            }
        }
    }

    /// Locate the reference row a record would use, without writing
    pub async fn find_reference(
        &self,
        workbook: &Path,
        record: OrderRecord,
    ) -> ScheduleResult<ReferenceMatch> {
        let config = self.config.clone();
        let record = record.normalized();
        self.in_session(
            workbook,
            Box::new(move |port, session, _| {
                let index = WorkbookIndex::build(port, session, &config)?;
                ReferenceMatcher::new(&config).find(&index, &record)
            }),
        )
        .await
    }

    async fn process_records(
        &self,
        workbook: &Path,
        records: Vec<OrderRecord>,
    ) -> ScheduleResult<(Vec<BatchResult>, Vec<RowAddress>)> {
        let guard = self.locks.acquire(workbook, self.lock_timeout).await?;
        self.process_locked(guard, workbook, records).await
    }

    async fn process_locked(
        &self,
        guard: OwnedMutexGuard<()>,
        workbook: &Path,
        records: Vec<OrderRecord>,
    ) -> ScheduleResult<(Vec<BatchResult>, Vec<RowAddress>)> {
        let config = self.config.clone();
        let ledger = self.ledger.clone();
        let path = workbook.to_path_buf();
        self.run_locked(
            guard,
            workbook,
            Box::new(move |port, session, cancelled| {
                let report = BatchProcessor::new(port, session, &config).run(&records)?;
                let change = LedgerChange::from_batch(&report);
                commit_and_save(&ledger, port, session, &path, change, cancelled)?;
                Ok((report.results, report.suspect_rows))
            }),
        )
        .await
    }

    //==========================================================================
    // Deletion ledger
    //==========================================================================

    /// Delete rows and return one undo token per row, in input order
    pub async fn delete(&self, workbook: &Path, entries: Vec<RowAddress>) -> ScheduleResult<Vec<UndoToken>> {
        let ledger = self.ledger.clone();
        let path = workbook.to_path_buf();
        let tokens = self
            .in_session(
                workbook,
                Box::new(move |port, session, cancelled| {
                    let change = ledger.delete(port, session, &entries)?;
                    let tokens: Vec<UndoToken> = change
                        .deletions
                        .iter()
                        .map(|d| d.undo_token.clone())
                        .collect();
                    commit_and_save(&ledger, port, session, &path, change, cancelled)?;
                    Ok(tokens)
                }),
            )
            .await?;
        info!(workbook = %workbook.display(), rows = tokens.len(), "rows deleted");
        Ok(tokens)
    }

    /// Restore a deleted or cancelled row, or put back the cells of a modification;
    /// returns the row touched
    pub async fn undo(&self, token: &UndoToken) -> ScheduleResult<RowAddress> {
        let (workbook, entry) = self.ledger.locate(token)?;
        let deletion = match entry {
            LedgerEntry::Deletion(_) => true,
            LedgerEntry::Modification(_) => false,
            LedgerEntry::Write(_) => {
                return Err(ScheduleError::UndoUnavailable {
                    token: format!("{} (a committed write, use revert-write)", token),
                });
            }
        };
        let workbook = PathBuf::from(workbook);
        let ledger = self.ledger.clone();
        let path = workbook.clone();
        let token = token.clone();
        let restored = self
            .in_session(
                &workbook,
                Box::new(move |port, session, cancelled| {
                    let (address, change) = if deletion {
                        ledger.undo(port, session, &path, &token)?
                    } else {
                        ledger.revert_modification(port, session, &path, &token)?
                    };
                    commit_and_save(&ledger, port, session, &path, change, cancelled)?;
                    Ok(address)
                }),
            )
            .await?;
        info!(workbook = %workbook.display(), row = %restored, deletion, "undone");
        Ok(restored)
    }

    /// Remove a committed order row; returns where it was
    pub async fn revert_write(&self, token: &UndoToken) -> ScheduleResult<RowAddress> {
        let (workbook, entry) = self.ledger.locate(token)?;
        if !matches!(entry, LedgerEntry::Write(_)) {
            return Err(ScheduleError::UndoUnavailable {
                token: format!("{} (not a committed write)", token),
            });
        }
        let workbook = PathBuf::from(workbook);
        let ledger = self.ledger.clone();
        let path = workbook.clone();
        let token = token.clone();
        let removed = self
            .in_session(
                &workbook,
                Box::new(move |port, session, cancelled| {
                    let (address, change) = ledger.revert_write(port, session, &path, &token)?;
                    commit_and_save(&ledger, port, session, &path, change, cancelled)?;
                    Ok(address)
                }),
            )
            .await?;
        info!(workbook = %workbook.display(), row = %removed, "write reverted");
        Ok(removed)
    }

    /// Drop an undo record; waits for its workbook so no operation is mid-commit
    pub async fn evict(&self, token: &UndoToken) -> ScheduleResult<()> {
        let (workbook, _) = self.ledger.locate(token)?;
        let _guard = self.locks.acquire(Path::new(&workbook), self.lock_timeout).await?;
        self.ledger.evict(token)
    }

    pub fn ledger_entries(&self, workbook: &Path) -> ScheduleResult<WorkbookLedger> {
        self.ledger.entries(workbook)
    }

    //==========================================================================
    // Retry scheduler
    //==========================================================================

    pub fn pending_retries(&self) -> ScheduleResult<Vec<PendingRetry>> {
        self.retries.pending()
    }

    pub fn schedule_retry(&self, ids: &[String], execute_at: Timestamp) -> ScheduleResult<()> {
        self.retries.schedule(ids, execute_at)
    }

    pub fn cancel_retry(&self, id: &str) -> ScheduleResult<PendingRetry> {
        self.retries.cancel(id)
    }

    /// Re-run the given items now, regardless of their due time
    pub async fn retry_now(&self, ids: &[String]) -> ScheduleResult<Vec<BatchResult>> {
        let items = self.retries.claim(ids)?;
        self.run_claimed(items).await
    }

    /// Run every item whose due time has passed. Ticks never overlap.
    pub async fn tick(&self) -> ScheduleResult<Vec<BatchResult>> {
        let _gate = self.tick_gate.lock().await;
        let items = self.retries.claim_due(self.retries.now())?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        info!(due = items.len(), "running scheduled retries");
        self.run_claimed(items).await
    }

    /// Run claimed items grouped by workbook; each item is settled exactly once
    async fn run_claimed(&self, items: Vec<PendingRetry>) -> ScheduleResult<Vec<BatchResult>> {
        let mut groups: Vec<(PathBuf, Vec<PendingRetry>)> = Vec::new();
        for item in items {
            match groups.iter_mut().find(|(path, _)| *path == item.workbook) {
                Some((_, group)) => group.push(item),
                None => groups.push((item.workbook.clone(), vec![item])),
            }
        }

        let mut results = Vec::new();
        for (workbook, group) in groups {
            let guard = match self.locks.acquire(&workbook, self.lock_timeout).await {
                Ok(guard) => guard,
                Err(e) => {
                    // Never started, so the attempt does not count
                    warn!(workbook = %workbook.display(), "workbook busy, retries returned to the queue");
                    self.retries.release(&group)?;
                    results.extend(group.iter().map(|i| BatchResult::failure(i.record.id.clone(), &e)));
                    continue;
                }
            };
            let records: Vec<OrderRecord> = group.iter().map(|i| i.record.clone()).collect();
            match self.process_locked(guard, &workbook, records).await {
                Ok((batch, _)) => {
                    for (item, result) in group.iter().zip(batch) {
                        self.retries.settle(item, &result)?;
                        results.push(result);
                    }
                }
                Err(e) => {
                    warn!(workbook = %workbook.display(), error = %e, "retry run aborted");
                    for item in &group {
                        self.retries.settle_aborted(item, &e)?;
                        results.push(BatchResult::failure(item.record.id.clone(), &e));
                    }
                }
            }
        }
        Ok(results)
    }

    //==========================================================================
    // Session plumbing
    //==========================================================================

    async fn in_session<T: Send + 'static>(
        &self,
        workbook: &Path,
        work: SessionWork<T>,
    ) -> ScheduleResult<T> {
        let guard = self.locks.acquire(workbook, self.lock_timeout).await?;
        self.run_locked(guard, workbook, work).await
    }

    /// Open a session, run `work` on the blocking pool and close the session
    async fn run_locked<T: Send + 'static>(
        &self,
        guard: OwnedMutexGuard<()>,
        workbook: &Path,
        work: SessionWork<T>,
    ) -> ScheduleResult<T> {
        let port = self.port.clone();
        let path = workbook.to_path_buf();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let task = tokio::task::spawn_blocking(move || {
            // Held until the document work really ends, even past a timeout
            let _guard = guard;
            let session = port.open(&path)?;
            let outcome = work(port.as_ref(), session, &*flag);
            if let Err(e) = port.close(session) {
                warn!(workbook = %path.display(), error = %e, "failed to close session");
            }
            outcome
        });

        match tokio::time::timeout(self.operation_timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(ScheduleError::document_lock(
                workbook,
                format!("document worker failed: {}", join),
            )),
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                warn!(workbook = %workbook.display(), timeout = ?self.operation_timeout, "document operation timed out");
                Err(timed_out(workbook, self.operation_timeout))
            }
        }
    }
}

fn timed_out(workbook: &Path, after: Duration) -> ScheduleError {
    ScheduleError::document_lock(
        workbook,
        format!("automation session unresponsive for more than {:?}", after),
    )
}

/// Record `change` in the ledger, then save. The ledger goes back to its previous state
/// when the save fails or the caller has already given up on this operation.
fn commit_and_save(
    ledger: &DeletionLedger,
    port: &dyn DocumentPort,
    session: SessionId,
    workbook: &Path,
    change: LedgerChange,
    cancelled: &AtomicBool,
) -> ScheduleResult<()> {
    if change.is_empty() {
        return Ok(());
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(ScheduleError::document_lock(workbook, "operation timed out before save"));
    }
    let previous = ledger.commit(workbook, change)?;
    if cancelled.load(Ordering::SeqCst) {
        ledger.restore(&previous)?;
        return Err(ScheduleError::document_lock(workbook, "operation timed out before save"));
    }
    if let Err(e) = port.save(session) {
        ledger.restore(&previous)?;
        return Err(match e {
            ScheduleError::DocumentLock { .. } => e,
            other => ScheduleError::document_lock(workbook, other),
        });
    }
    Ok(())
}
