//! Retry Scheduler: durable queue of failed order records
//!
//! Items come from failed batch results. They are re-run only on request: `retry_now` for
//! any item, or `tick` for items whose `execute_at` has passed. A re-run consumes the item
//! whatever the outcome; a failure leaves a fresh manual item with the attempt count
//! bumped, so nothing is retried automatically forever.
//!
//! Every change is one read-modify-write under the store's lock, so concurrent batches,
//! ticks and manual calls never drop each other's items.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::{ScheduleError, ScheduleResult};
use crate::store::{transact, StateStore};
use crate::types::{BatchResult, OrderRecord, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    #[default]
    Pending,
    /// Claimed by a running retry
    Running,
    /// Reached the attempt cap; waits for manual intervention
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRetry {
    pub id: String,
    pub workbook: PathBuf,
    pub record: OrderRecord,
    /// `None` = immediate: only runs through `retry_now`
    #[serde(default)]
    pub execute_at: Option<Timestamp>,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub status: RetryStatus,
    pub created_at: Timestamp,
}

impl PendingRetry {
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == RetryStatus::Pending && self.execute_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryQueue {
    pub items: Vec<PendingRetry>,
}

pub struct RetryScheduler {
    store: Arc<dyn StateStore<RetryQueue>>,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn StateStore<RetryQueue>>,
        clock: Arc<dyn Clock>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn pending(&self) -> ScheduleResult<Vec<PendingRetry>> {
        Ok(self.store.load()?.items)
    }

    pub fn get(&self, id: &str) -> ScheduleResult<PendingRetry> {
        self.store
            .load()?
            .items
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| ScheduleError::UnknownRetry(id.to_string()))
    }

    /// Queue failed records as immediate items. `attempts` is the number of failed runs.
    pub fn enqueue(
        &self,
        workbook: &Path,
        failures: Vec<(OrderRecord, String)>,
        attempts: u32,
    ) -> ScheduleResult<Vec<PendingRetry>> {
        if failures.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let added: Vec<PendingRetry> = failures
            .into_iter()
            .map(|(record, reason)| PendingRetry {
                id: uuid::Uuid::new_v4().to_string(),
                workbook: workbook.to_path_buf(),
                record,
                execute_at: None,
                attempt_count: attempts,
                last_failure_reason: Some(reason),
                status: self.status_for(attempts),
                created_at: now,
            })
            .collect();
        self.store.update(&mut |queue| {
            queue.items.extend(added.iter().cloned());
            Ok(true)
        })?;
        info!(workbook = %workbook.display(), count = added.len(), "failures queued for retry");
        Ok(added)
    }

    /// Give items a due time for `tick`
    pub fn schedule(&self, ids: &[String], execute_at: Timestamp) -> ScheduleResult<()> {
        self.store.update(&mut |queue| {
            for id in ids {
                let item = queue
                    .items
                    .iter()
                    .find(|i| &i.id == id)
                    .ok_or_else(|| ScheduleError::UnknownRetry(id.clone()))?;
                match item.status {
                    RetryStatus::Exhausted => {
                        return Err(ScheduleError::RetryExhausted {
                            id: id.clone(),
                            attempts: item.attempt_count,
                        })
                    }
                    RetryStatus::Running => {
                        return Err(ScheduleError::UnknownRetry(format!("{} (already running)", id)))
                    }
                    RetryStatus::Pending => {}
                }
            }
            for item in queue.items.iter_mut().filter(|i| ids.contains(&i.id)) {
                item.execute_at = Some(execute_at);
            }
            Ok(true)
        })?;
        info!(count = ids.len(), at = %execute_at, "retries scheduled");
        Ok(())
    }

    /// Remove an item that has not started
    pub fn cancel(&self, id: &str) -> ScheduleResult<PendingRetry> {
        let item = transact(self.store.as_ref(), |queue: &mut RetryQueue| {
            let pos = queue
                .items
                .iter()
                .position(|i| i.id == id && i.status != RetryStatus::Running)
                .ok_or_else(|| ScheduleError::UnknownRetry(id.to_string()))?;
            Ok((true, queue.items.remove(pos)))
        })?;
        info!(id, "retry cancelled");
        Ok(item)
    }

    /// Mark the given items running. Unknown or already running ids are an error.
    pub fn claim(&self, ids: &[String]) -> ScheduleResult<Vec<PendingRetry>> {
        transact(self.store.as_ref(), |queue: &mut RetryQueue| {
            for id in ids {
                let ok = queue
                    .items
                    .iter()
                    .any(|i| &i.id == id && i.status != RetryStatus::Running);
                if !ok {
                    return Err(ScheduleError::UnknownRetry(id.clone()));
                }
            }
            Ok((true, mark_running(queue, |i| ids.contains(&i.id))))
        })
    }

    /// Claim every item due at `now`
    pub fn claim_due(&self, now: Timestamp) -> ScheduleResult<Vec<PendingRetry>> {
        transact(self.store.as_ref(), |queue: &mut RetryQueue| {
            let claimed = mark_running(queue, |i| i.is_due(now));
            Ok((!claimed.is_empty(), claimed))
        })
    }

    /// Consume a claimed item. A failed outcome queues a manual replacement.
    pub fn settle(&self, item: &PendingRetry, result: &BatchResult) -> ScheduleResult<Option<PendingRetry>> {
        self.settle_with(item, result.is_success(), result.reason.clone())
    }

    /// Consume a claimed item whose run was aborted before producing a result
    pub fn settle_aborted(&self, item: &PendingRetry, error: &ScheduleError) -> ScheduleResult<Option<PendingRetry>> {
        self.settle_with(item, false, Some(error.to_string()))
    }

    /// Put claimed items back untouched (e.g. the workbook lock could not be acquired)
    pub fn release(&self, items: &[PendingRetry]) -> ScheduleResult<()> {
        self.store.update(&mut |queue| {
            for item in queue.items.iter_mut() {
                if let Some(original) = items.iter().find(|c| c.id == item.id) {
                    item.status = original.status;
                }
            }
            Ok(true)
        })
    }

    /// Return items stranded as running by an interrupted process to the queue
    pub fn recover(&self) -> ScheduleResult<usize> {
        let recovered = transact(self.store.as_ref(), |queue: &mut RetryQueue| {
            let mut recovered = 0;
            for item in queue.items.iter_mut().filter(|i| i.status == RetryStatus::Running) {
                item.status = self.status_for(item.attempt_count);
                recovered += 1;
            }
            Ok((recovered > 0, recovered))
        })?;
        if recovered > 0 {
            warn!(recovered, "interrupted retries returned to the queue");
        }
        Ok(recovered)
    }

    fn settle_with(
        &self,
        item: &PendingRetry,
        success: bool,
        reason: Option<String>,
    ) -> ScheduleResult<Option<PendingRetry>> {
        let replacement = (!success).then(|| {
            let attempts = item.attempt_count + 1;
            PendingRetry {
                id: uuid::Uuid::new_v4().to_string(),
                workbook: item.workbook.clone(),
                record: item.record.clone(),
                execute_at: None,
                attempt_count: attempts,
                last_failure_reason: reason,
                status: self.status_for(attempts),
                created_at: self.clock.now(),
            }
        });
        self.store.update(&mut |queue| {
            queue.items.retain(|i| i.id != item.id);
            queue.items.extend(replacement.iter().cloned());
            Ok(true)
        })?;
        if let Some(next) = &replacement {
            if next.status == RetryStatus::Exhausted {
                warn!(record = %next.record.id, attempts = next.attempt_count, "retry exhausted, manual intervention needed");
            }
        }
        Ok(replacement)
    }

    fn status_for(&self, attempts: u32) -> RetryStatus {
        if attempts >= self.config.max_attempts {
            RetryStatus::Exhausted
        } else {
            RetryStatus::Pending
        }
    }
}

/// Set matching non-running items to running; returns them with their previous status
fn mark_running(queue: &mut RetryQueue, mut pick: impl FnMut(&PendingRetry) -> bool) -> Vec<PendingRetry> {
    let mut claimed = Vec::new();
    for item in queue.items.iter_mut() {
        if item.status != RetryStatus::Running && pick(item) {
            claimed.push(item.clone());
            item.status = RetryStatus::Running;
        }
    }
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    fn scheduler() -> (RetryScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()));
        let store: Arc<dyn StateStore<RetryQueue>> = Arc::new(MemoryStore::<RetryQueue>::new());
        let scheduler = RetryScheduler::new(store, clock.clone(), RetryConfig::default());
        (scheduler, clock)
    }

    fn failure() -> Vec<(OrderRecord, String)> {
        vec![(OrderRecord::new("1001", Some("S001")).with_id("po-1"), "locked".to_string())]
    }

    #[test]
    fn test_immediate_items_are_never_due() {
        let (s, clock) = scheduler();
        s.enqueue(Path::new("w.xlsx"), failure(), 1).unwrap();
        clock.advance(Duration::days(7));
        assert!(s.claim_due(clock.now()).unwrap().is_empty());
    }

    #[test]
    fn test_claim_due_marks_running() {
        let (s, clock) = scheduler();
        let item = s.enqueue(Path::new("w.xlsx"), failure(), 1).unwrap().remove(0);
        s.schedule(&[item.id.clone()], clock.now() + Duration::minutes(5)).unwrap();
        assert!(s.claim_due(clock.now()).unwrap().is_empty());

        clock.advance(Duration::minutes(5));
        let claimed = s.claim_due(clock.now()).unwrap();
        assert_eq!(claimed.len(), 1);
        // a second tick does not pick it up again
        assert!(s.claim_due(clock.now()).unwrap().is_empty());
        assert!(s.cancel(&item.id).is_err());
    }

    #[test]
    fn test_failed_settle_bumps_attempts_until_exhausted() {
        let (s, _) = scheduler();
        let item = s.enqueue(Path::new("w.xlsx"), failure(), 2).unwrap().remove(0);
        let claimed = s.claim(&[item.id.clone()]).unwrap().remove(0);
        let err = ScheduleError::document_lock("w.xlsx", "busy");
        let next = s.settle_aborted(&claimed, &err).unwrap().unwrap();

        assert_eq!(next.attempt_count, 3);
        assert_eq!(next.status, RetryStatus::Exhausted);
        assert!(matches!(
            s.schedule(&[next.id.clone()], s.now()),
            Err(ScheduleError::RetryExhausted { attempts: 3, .. })
        ));
        assert_eq!(s.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_release_restores_status() {
        let (s, _) = scheduler();
        let item = s.enqueue(Path::new("w.xlsx"), failure(), 1).unwrap().remove(0);
        let claimed = s.claim(&[item.id.clone()]).unwrap();
        s.release(&claimed).unwrap();
        assert_eq!(s.get(&item.id).unwrap().status, RetryStatus::Pending);
    }

    #[test]
    fn test_recover_resets_running_items() {
        let (s, _) = scheduler();
        let item = s.enqueue(Path::new("w.xlsx"), failure(), 1).unwrap().remove(0);
        s.claim(&[item.id.clone()]).unwrap();
        assert_eq!(s.recover().unwrap(), 1);
        assert_eq!(s.get(&item.id).unwrap().status, RetryStatus::Pending);
    }

    #[test]
    fn test_cancel_unknown() {
        let (s, _) = scheduler();
        assert!(matches!(s.cancel("nope"), Err(ScheduleError::UnknownRetry(_))));
    }

    #[test]
    fn test_concurrent_enqueue_and_settle_keep_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()));
        let store: Arc<dyn StateStore<RetryQueue>> =
            Arc::new(crate::store::JsonFileStore::new(dir.path().join("retries.json")));
        let s = Arc::new(RetryScheduler::new(store, clock, RetryConfig::default()));
        let first = s.enqueue(Path::new("w.xlsx"), failure(), 1).unwrap().remove(0);
        let claimed = s.claim(&[first.id.clone()]).unwrap().remove(0);

        let handles: Vec<_> = (0..6)
            .map(|n| {
                let s = s.clone();
                let claimed = claimed.clone();
                std::thread::spawn(move || {
                    if n == 0 {
                        let err = ScheduleError::document_lock("w.xlsx", "busy");
                        s.settle_aborted(&claimed, &err).unwrap();
                    } else {
                        s.enqueue(Path::new("w.xlsx"), failure(), 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let items = s.pending().unwrap();
        // five new items plus the replacement for the settled one
        assert_eq!(items.len(), 6);
        assert!(items.iter().all(|i| i.id != first.id));
        assert_eq!(items.iter().filter(|i| i.attempt_count == 2).count(), 1);
    }
}
