//! Persistence of task records.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use taskd_core::{Task, TaskId, TaskState};
use thiserror::Error;
use tracing::warn;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt task record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where task records live. Never deletes records.
pub trait TaskStore: Send + Sync {
    /// Reserve the next task identifier.
    fn next_id(&self) -> Result<TaskId, StoreError>;

    /// Insert or replace a record.
    fn save(&self, task: &Task) -> Result<(), StoreError>;

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Records in any of `states`, ordered by id. An empty slice matches all.
    fn query(&self, states: &[TaskState]) -> Result<Vec<Task>, StoreError>;
}

fn matches(task: &Task, states: &[TaskState]) -> bool {
    states.is_empty() || states.contains(&task.state)
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    last_id: u64,
    tasks: BTreeMap<TaskId, Task>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskStore for MemoryTaskStore {
    fn next_id(&self) -> Result<TaskId, StoreError> {
        let mut inner = self.lock();
        inner.last_id += 1;
        Ok(TaskId::new(inner.last_id))
    }

    fn save(&self, task: &Task) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.last_id = inner.last_id.max(task.id.get());
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    fn query(&self, states: &[TaskState]) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| matches(t, states))
            .cloned()
            .collect())
    }
}

/// One JSON document per task, named `<id>.json`.
pub struct JsonFileTaskStore {
    dir: PathBuf,
    last_id: Mutex<u64>,
}

impl JsonFileTaskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let last_id = Self::ids(&dir)?.into_iter().max().unwrap_or(0);
        Ok(Self {
            dir,
            last_id: Mutex::new(last_id),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn ids(dir: &Path) -> Result<Vec<u64>, StoreError> {
        let entries = fs::read_dir(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn read(&self, path: &Path) -> Result<Task, StoreError> {
        let data = fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl TaskStore for JsonFileTaskStore {
    fn next_id(&self) -> Result<TaskId, StoreError> {
        let mut last = self.last_id.lock().unwrap_or_else(PoisonError::into_inner);
        *last += 1;
        Ok(TaskId::new(*last))
    }

    fn save(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.path(task.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(task)?;
        fs::write(&tmp, data).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    fn query(&self, states: &[TaskState]) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for id in Self::ids(&self.dir)? {
            let path = self.path(TaskId::new(id));
            match self.read(&path) {
                Ok(task) if matches(&task, states) => tasks.push(task),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable task record"),
            }
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskd_core::Args;

    #[test]
    fn test_memory_store_ids_are_monotonic() {
        let store = MemoryTaskStore::new();
        let a = store.next_id().unwrap();
        let b = store.next_id().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_memory_store_query_by_state() {
        let store = MemoryTaskStore::new();
        let mut running = Task::new(store.next_id().unwrap(), "test.sleep", Args::default());
        running.set_state(TaskState::Executing);
        let done = {
            let mut t = Task::new(store.next_id().unwrap(), "test.sleep", Args::default());
            t.set_state(TaskState::Finished);
            t
        };
        store.save(&running).unwrap();
        store.save(&done).unwrap();

        let active = store.query(&[TaskState::Executing, TaskState::Waiting]).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id);
        assert_eq!(store.query(&[]).unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = JsonFileTaskStore::open(dir.path()).unwrap();
            let id = store.next_id().unwrap();
            let mut task = Task::new(id, "disk.erase", Args::default());
            task.set_state(TaskState::Waiting);
            store.save(&task).unwrap();
            id
        };

        let store = JsonFileTaskStore::open(dir.path()).unwrap();
        assert!(store.next_id().unwrap() > id);
        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(store.query(&[TaskState::Waiting]).unwrap().len(), 1);
        assert!(store.get(TaskId::new(999)).unwrap().is_none());
    }
}
