//! In-memory Document Port binding
//!
//! Sessions work on a copy of the stored workbook; `save` writes the copy back and
//! `close` drops it, so an aborted call leaves the stored workbook untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{ScheduleError, ScheduleResult};
use crate::types::{CellValue, RowSnapshot};

use super::workbook::WorkbookData;
use super::{DocumentPort, FormattingSource, SessionId};

/// Injected failure. `after` counts successful calls of that kind to let through first.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    LockedOnOpen,
    /// Insert half the values, then fail with `PartialWrite`
    PartialInsert { after: usize },
    LockedOnInsert { after: usize },
    LockedOnDelete { after: usize },
    LockedOnSave,
    /// Block the insert call, simulating an unresponsive automation session
    StallOnInsert { after: usize, duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Open,
    Insert,
    Delete,
    Save,
}

impl Fault {
    fn op(&self) -> Op {
        match self {
            Fault::LockedOnOpen => Op::Open,
            Fault::PartialInsert { .. }
            | Fault::LockedOnInsert { .. }
            | Fault::StallOnInsert { .. } => Op::Insert,
            Fault::LockedOnDelete { .. } => Op::Delete,
            Fault::LockedOnSave => Op::Save,
        }
    }

    fn after_mut(&mut self) -> Option<&mut usize> {
        match self {
            Fault::PartialInsert { after }
            | Fault::LockedOnInsert { after }
            | Fault::LockedOnDelete { after }
            | Fault::StallOnInsert { after, .. } => Some(after),
            Fault::LockedOnOpen | Fault::LockedOnSave => None,
        }
    }
}

#[derive(Debug)]
struct Session {
    path: PathBuf,
    data: WorkbookData,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<PathBuf, WorkbookData>,
    sessions: HashMap<SessionId, Session>,
    next_session: u64,
    faults: Vec<Fault>,
}

impl State {
    /// Take the first due fault for `op`; count down the others of the same kind.
    fn take_fault(&mut self, op: Op) -> Option<Fault> {
        let mut fired = None;
        for (i, fault) in self.faults.iter_mut().enumerate() {
            if fault.op() != op {
                continue;
            }
            match fault.after_mut() {
                Some(after) if *after > 0 => *after -= 1,
                _ if fired.is_none() => fired = Some(i),
                _ => {}
            }
        }
        fired.map(|i| self.faults.remove(i))
    }

    fn session(&self, id: SessionId) -> ScheduleResult<&Session> {
        self.sessions
            .get(&id)
            .ok_or_else(|| ScheduleError::document_lock(PathBuf::new(), format!("{} is not open", id)))
    }

    fn session_mut(&mut self, id: SessionId) -> ScheduleResult<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| ScheduleError::document_lock(PathBuf::new(), format!("{} is not open", id)))
    }
}

/// In-memory workbooks keyed by path
#[derive(Debug, Default)]
pub struct MemoryPort {
    state: Mutex<State>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a workbook under `path`
    pub fn with_workbook(self, path: impl Into<PathBuf>, data: WorkbookData) -> Self {
        self.put_workbook(path, data);
        self
    }

    pub fn put_workbook(&self, path: impl Into<PathBuf>, data: WorkbookData) {
        self.lock().files.insert(path.into(), data);
    }

    /// Saved content of a workbook (unsaved session changes excluded)
    pub fn workbook(&self, path: &Path) -> Option<WorkbookData> {
        self.lock().files.get(path).cloned()
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic in another test thread must not hide this port's state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DocumentPort for MemoryPort {
    fn open(&self, path: &Path) -> ScheduleResult<SessionId> {
        let mut state = self.lock();
        if state.take_fault(Op::Open).is_some() {
            return Err(ScheduleError::document_lock(path, "workbook locked by another user"));
        }
        if state.sessions.values().any(|s| s.path == path) {
            return Err(ScheduleError::document_lock(path, "workbook already open in another session"));
        }
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ScheduleError::document_lock(path, "no such workbook"))?;
        state.next_session += 1;
        let id = SessionId(state.next_session);
        state.sessions.insert(
            id,
            Session {
                path: path.to_path_buf(),
                data,
            },
        );
        Ok(id)
    }

    fn sheet_names(&self, session: SessionId) -> ScheduleResult<Vec<String>> {
        Ok(self.lock().session(session)?.data.sheet_names())
    }

    fn row_count(&self, session: SessionId, sheet: &str) -> ScheduleResult<u32> {
        Ok(self.lock().session(session)?.data.sheet(sheet)?.row_count())
    }

    fn read_row(&self, session: SessionId, sheet: &str, row: u32) -> ScheduleResult<RowSnapshot> {
        self.lock().session(session)?.data.sheet(sheet)?.read(row)
    }

    fn insert_row(
        &self,
        session: SessionId,
        sheet: &str,
        at: u32,
        values: &[CellValue],
        formatting: &FormattingSource,
    ) -> ScheduleResult<()> {
        let fault = {
            let mut state = self.lock();
            state.session(session)?;
            state.take_fault(Op::Insert)
        };

        match fault {
            Some(Fault::StallOnInsert { duration, .. }) => std::thread::sleep(duration),
            Some(Fault::LockedOnInsert { .. }) => {
                let state = self.lock();
                let path = state.session(session)?.path.clone();
                return Err(ScheduleError::document_lock(path, "automation session stopped responding"));
            }
            Some(Fault::PartialInsert { .. }) => {
                let mut state = self.lock();
                let half = &values[..values.len() / 2];
                state
                    .session_mut(session)?
                    .data
                    .sheet_mut(sheet)?
                    .insert(at, half, &FormattingSource::None)?;
                return Err(ScheduleError::partial_write(
                    sheet,
                    at,
                    format!("only {} of {} cells written", half.len(), values.len()),
                ));
            }
            _ => {}
        }

        let mut state = self.lock();
        state
            .session_mut(session)?
            .data
            .sheet_mut(sheet)?
            .insert(at, values, formatting)
    }

    fn delete_row(&self, session: SessionId, sheet: &str, row: u32) -> ScheduleResult<()> {
        let mut state = self.lock();
        if state.take_fault(Op::Delete).is_some() {
            let path = state.session(session)?.path.clone();
            return Err(ScheduleError::document_lock(path, "automation session stopped responding"));
        }
        state.session_mut(session)?.data.sheet_mut(sheet)?.delete(row)?;
        Ok(())
    }

    fn write_cells(
        &self,
        session: SessionId,
        sheet: &str,
        row: u32,
        cells: &[(u16, CellValue)],
    ) -> ScheduleResult<()> {
        let mut state = self.lock();
        state
            .session_mut(session)?
            .data
            .sheet_mut(sheet)?
            .write_cells(row, cells)
    }

    fn add_sheet(&self, session: SessionId, name: &str) -> ScheduleResult<()> {
        self.lock().session_mut(session)?.data.add_sheet(name)
    }

    fn save(&self, session: SessionId) -> ScheduleResult<()> {
        let mut state = self.lock();
        let (path, data) = {
            let s = state.session(session)?;
            (s.path.clone(), s.data.clone())
        };
        if state.take_fault(Op::Save).is_some() {
            return Err(ScheduleError::document_lock(path, "file is read-only"));
        }
        state.files.insert(path, data);
        Ok(())
    }

    fn close(&self, session: SessionId) -> ScheduleResult<()> {
        self.lock().sessions.remove(&session);
        Ok(())
    }
}
