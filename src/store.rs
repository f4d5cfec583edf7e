//! Persistence for ledger and retry state
//!
//! State is a single JSON document per concern. File writes go through a temp file in the
//! target directory followed by a rename, so a crash mid-write keeps the previous state.
//! Read-modify-write cycles go through [`StateStore::update`], which holds the store's
//! lock from load to save.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{ScheduleError, ScheduleResult};

/// Load/save of one piece of typed state
pub trait StateStore<T>: Send + Sync {
    /// Current state, or `T::default()` when nothing was saved yet
    fn load(&self) -> ScheduleResult<T>;

    fn save(&self, state: &T) -> ScheduleResult<()>;

    /// Load, apply and save with no other update or save in between.
    ///
    /// `apply` runs exactly once and returns whether it changed the state; an unchanged
    /// state is not written. An `Err` from `apply` leaves the stored state untouched.
    fn update(&self, apply: &mut dyn FnMut(&mut T) -> ScheduleResult<bool>) -> ScheduleResult<()>;
}

/// Run `apply` through [`StateStore::update`] and return what it produced.
///
/// `apply` returns `(changed, output)`.
pub fn transact<T, R>(
    store: &dyn StateStore<T>,
    mut apply: impl FnMut(&mut T) -> ScheduleResult<(bool, R)>,
) -> ScheduleResult<R> {
    let mut output = None;
    store.update(&mut |state| {
        let (changed, value) = apply(state)?;
        output = Some(value);
        Ok(changed)
    })?;
    output.ok_or_else(|| ScheduleError::Config("state update did not run".to_string()))
}

/// Write `bytes` to `dest` via a temp file in the same directory
pub(crate) fn atomic_write(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // `parent()` is `Some("")` for bare file names
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Pretty-printed JSON file.
///
/// Updates are serialized within the process; one store instance per file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T: DeserializeOwned + Default>(&self) -> ScheduleResult<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write<T: Serialize>(&self, state: &T) -> ScheduleResult<()> {
        let json = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }
}

impl<T> StateStore<T> for JsonFileStore
where
    T: Serialize + DeserializeOwned + Default,
{
    fn load(&self) -> ScheduleResult<T> {
        let _held = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read()
    }

    fn save(&self, state: &T) -> ScheduleResult<()> {
        let _held = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.write(state)
    }

    fn update(&self, apply: &mut dyn FnMut(&mut T) -> ScheduleResult<bool>) -> ScheduleResult<()> {
        let _held = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut state: T = self.read()?;
        if apply(&mut state)? {
            self.write(&state)?;
        }
        Ok(())
    }
}

/// Process-local store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore<T> {
    state: Mutex<T>,
}

impl<T: Default> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> StateStore<T> for MemoryStore<T>
where
    T: Clone + Send,
{
    fn load(&self) -> ScheduleResult<T> {
        let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.clone())
    }

    fn save(&self, state: &T) -> ScheduleResult<()> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *guard = state.clone();
        Ok(())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut T) -> ScheduleResult<bool>) -> ScheduleResult<()> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut state = guard.clone();
        if apply(&mut state)? {
            *guard = state;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn bump(store: &dyn StateStore<BTreeMap<String, u32>>, key: &str) -> ScheduleResult<u32> {
        transact(store, |state| {
            let count = state.entry(key.to_string()).or_insert(0);
            *count += 1;
            Ok((true, *count))
        })
    }

    #[test]
    fn test_json_store_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("state/ledger.json"));
        let state: BTreeMap<String, u32> = store.load().unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_json_store_round_trip_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/retries.json"));
        let mut state = BTreeMap::new();
        state.insert("po-1".to_string(), 2u32);
        store.save(&state).unwrap();

        let loaded: BTreeMap<String, u32> = store.load().unwrap();
        assert_eq!(loaded, state);
        // no temp files left next to the state file
        let entries = fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(&path);
        let result: ScheduleResult<BTreeMap<String, u32>> = store.load();
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("counts.json")));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        bump(store.as_ref(), "saves").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let state: BTreeMap<String, u32> = store.load().unwrap();
        assert_eq!(state["saves"], 200);
    }

    #[test]
    fn test_failed_update_keeps_previous_state() {
        let store = MemoryStore::<BTreeMap<String, u32>>::new();
        bump(&store, "a").unwrap();
        let result = store.update(&mut |state| {
            state.insert("a".to_string(), 99);
            Err(ScheduleError::Config("rejected".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.load().unwrap()["a"], 1);
        assert_eq!(bump(&store, "a").unwrap(), 2);
    }
}
