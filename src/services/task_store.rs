//! Durable task table.
//!
//! Every record is its own JSON file (`<dir>/<id>.json`), written atomically
//! with a temp file and a rename. An update is applied to a copy of the one
//! record it touches and only replaces the in-memory record once that file
//! was written, so memory and disk never disagree and a progress tick costs
//! one small write however many tasks are kept. A single mutex serializes
//! everything, which makes the `queued -> running` claim a compare-and-swap.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::services::task::{TaskRecord, TaskStatus};

pub const TASKS_DIR_NAME: &str = "tasks";

const RECORD_EXTENSION: &str = "json";
const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// How a running task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Default)]
struct Table {
    next_sequence: u64,
    tasks: BTreeMap<String, TaskRecord>,
}

pub struct TaskStore {
    dir: Option<PathBuf>,
    table: Mutex<Table>,
}

impl TaskStore {
    /// Open the store kept in `dir`, loading every record found there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut table = Table::default();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        for entry in entries.into_iter().flatten() {
            let path = entry?.path();
            let is_record = path.extension() == Some(OsStr::new(RECORD_EXTENSION))
                && !path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with('.'));
            if !is_record {
                continue;
            }

            let content = fs::read_to_string(&path)?;
            let record: TaskRecord = serde_json::from_str(&content)
                .map_err(|e| EngineError::Store(format!("invalid {}: {}", path.display(), e)))?;
            table.next_sequence = table.next_sequence.max(record.sequence + 1);
            table.tasks.insert(record.id.clone(), record);
        }

        debug!(dir = %dir.display(), tasks = table.tasks.len(), "task store opened");
        Ok(Self {
            dir: Some(dir),
            table: Mutex::new(table),
        })
    }

    /// A store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            table: Mutex::new(Table::default()),
        }
    }

    /// Turn every `queued`/`running` record into `interrupted`. Run once at startup.
    pub fn reconcile_interrupted(&self) -> Result<usize> {
        let mut table = self.lock();
        let now = Utc::now();
        let mut count = 0;
        for task in table.tasks.values_mut() {
            if !task.status.is_active() {
                continue;
            }
            let mut next = task.clone();
            next.status = TaskStatus::Interrupted;
            next.current_item = None;
            next.error = Some(INTERRUPTED_MESSAGE.to_string());
            next.finished_at.get_or_insert(now);
            next.updated_at = now;
            self.write_record(&next)?;
            *task = next;
            count += 1;
        }

        if count > 0 {
            info!(count, "stale tasks marked interrupted");
        }
        Ok(count)
    }

    /// Insert a new record, assigning its sequence number.
    pub fn insert(&self, mut record: TaskRecord) -> Result<TaskRecord> {
        let mut table = self.lock();
        record.sequence = table.next_sequence;
        self.write_record(&record)?;
        table.next_sequence += 1;
        table.tasks.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(id).cloned()
    }

    /// Newest first, at most `limit` records plus any active ones outside that window.
    pub fn list(&self, limit: usize) -> Vec<TaskRecord> {
        let table = self.lock();
        let mut records: Vec<&TaskRecord> = table.tasks.values().collect();
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        records
            .into_iter()
            .enumerate()
            .filter(|(index, task)| *index < limit || task.status.is_active())
            .map(|(_, task)| task.clone())
            .collect()
    }

    /// Compare-and-swap `queued -> running`. `None` when the task is gone or not queued.
    pub fn claim(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.update(id, |task| {
            if task.status != TaskStatus::Queued {
                return None;
            }
            let now = Utc::now();
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.updated_at = now;
            Some(task.clone())
        })
    }

    /// Record the unit count of a running task before its first unit.
    pub fn set_total_units(&self, id: &str, total: u64) -> Result<()> {
        self.update(id, |task| {
            (task.status == TaskStatus::Running).then(|| {
                task.total_units = total;
                task.processed_units = 0;
                task.updated_at = Utc::now();
            })
        })
        .map(drop)
    }

    /// Persist progress. `processed_units` never goes backwards or past the total.
    pub fn record_progress(&self, id: &str, processed: u64, current_item: Option<String>) -> Result<()> {
        self.update(id, |task| {
            (task.status == TaskStatus::Running).then(|| {
                task.processed_units = processed.min(task.total_units).max(task.processed_units);
                task.current_item = current_item;
                task.updated_at = Utc::now();
            })
        })
        .map(drop)
    }

    /// Compare-and-swap `queued -> cancelled`. `None` when the task was not queued.
    pub fn cancel_if_queued(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.update(id, |task| {
            if task.status != TaskStatus::Queued {
                return None;
            }
            let now = Utc::now();
            task.status = TaskStatus::Cancelled;
            task.cancel_requested = true;
            task.current_item = None;
            task.finished_at.get_or_insert(now);
            task.updated_at = now;
            Some(task.clone())
        })
    }

    /// Raise the cancel flag on a running task. Returns the record as it stands.
    pub fn request_cancel(&self, id: &str) -> Result<Option<TaskRecord>> {
        let flagged = self.update(id, |task| {
            if task.status != TaskStatus::Running || task.cancel_requested {
                return None;
            }
            task.cancel_requested = true;
            task.updated_at = Utc::now();
            Some(task.clone())
        })?;
        Ok(flagged.or_else(|| self.get(id)))
    }

    pub fn is_cancel_requested(&self, id: &str) -> bool {
        self.lock()
            .tasks
            .get(id)
            .is_some_and(|task| task.cancel_requested)
    }

    /// Move a running task to its terminal state. No-op unless it is `running`.
    pub fn finish(&self, id: &str, outcome: TaskOutcome) -> Result<Option<TaskRecord>> {
        self.update(id, |task| {
            if task.status != TaskStatus::Running {
                return None;
            }
            let now = Utc::now();
            match outcome {
                TaskOutcome::Completed => {
                    task.status = TaskStatus::Completed;
                    task.processed_units = task.total_units;
                    task.error = None;
                }
                TaskOutcome::Failed(message) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(message);
                }
                TaskOutcome::Cancelled => {
                    task.status = TaskStatus::Cancelled;
                }
            }
            task.current_item = None;
            task.finished_at.get_or_insert(now);
            task.updated_at = now;
            Some(task.clone())
        })
    }

    /// Drop every `completed` record. Returns how many were removed.
    pub fn clear_completed(&self) -> Result<usize> {
        let mut table = self.lock();
        let completed: Vec<String> = table
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Completed)
            .map(|task| task.id.clone())
            .collect();

        for id in &completed {
            self.remove_record(id)?;
            table.tasks.remove(id);
        }
        Ok(completed.len())
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Records are only replaced whole, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `apply` to a copy of one record. `None` from `apply` means nothing changed
    /// and nothing is written; otherwise the copy is persisted and then swapped in.
    fn update<R>(&self, id: &str, apply: impl FnOnce(&mut TaskRecord) -> Option<R>) -> Result<Option<R>> {
        let mut table = self.lock();
        let Some(current) = table.tasks.get_mut(id) else {
            return Ok(None);
        };

        let mut next = current.clone();
        let Some(result) = apply(&mut next) else {
            return Ok(None);
        };
        self.write_record(&next)?;
        *current = next;
        Ok(Some(result))
    }

    fn record_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Atomic write: temp file first, then rename.
    fn write_record(&self, record: &TaskRecord) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = Self::record_path(dir, &record.id);
        let temp_path = dir.join(format!(".{}.{}.tmp", record.id, RECORD_EXTENSION));
        let content = serde_json::to_string_pretty(record)?;

        fs::create_dir_all(dir)
            .and_then(|_| fs::write(&temp_path, content))
            .and_then(|_| fs::rename(&temp_path, &path))
            .map_err(|e| EngineError::Store(format!("failed to write {}: {}", path.display(), e)))
    }

    fn remove_record(&self, id: &str) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = Self::record_path(dir, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "task record already gone");
                Ok(())
            }
            Err(e) => Err(EngineError::Store(format!("failed to remove {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::file_ops::FileOperationType;
    use crate::services::task::NewTransfer;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::queued(
            id.to_string(),
            NewTransfer::new(FileOperationType::Copy, "/src", "/dst", ["a.txt"]),
        )
    }

    #[test]
    fn claim_is_compare_and_swap() {
        let store = TaskStore::in_memory();
        store.insert(record("t1")).unwrap();

        let claimed = store.claim("t1").unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(store.claim("t1").unwrap().is_none());
        assert!(store.claim("missing").unwrap().is_none());
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let store = TaskStore::in_memory();
        store.insert(record("t1")).unwrap();
        store.claim("t1").unwrap();
        store.set_total_units("t1", 5).unwrap();

        store.record_progress("t1", 3, Some("/dst/a".into())).unwrap();
        store.record_progress("t1", 2, None).unwrap();
        assert_eq!(store.get("t1").unwrap().processed_units, 3);

        store.record_progress("t1", 99, None).unwrap();
        assert_eq!(store.get("t1").unwrap().processed_units, 5);
    }

    #[test]
    fn finish_sets_terminal_fields() {
        let store = TaskStore::in_memory();
        store.insert(record("ok")).unwrap();
        store.insert(record("bad")).unwrap();
        for id in ["ok", "bad"] {
            store.claim(id).unwrap();
            store.set_total_units(id, 4).unwrap();
            store.record_progress(id, 2, Some("/dst/x".into())).unwrap();
        }

        let ok = store.finish("ok", TaskOutcome::Completed).unwrap().unwrap();
        assert_eq!(ok.status, TaskStatus::Completed);
        assert_eq!(ok.processed_units, 4);
        assert_eq!(ok.current_item, None);
        assert!(ok.finished_at.is_some());

        let bad = store
            .finish("bad", TaskOutcome::Failed("disk full".into()))
            .unwrap()
            .unwrap();
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("disk full"));
        assert_eq!(bad.processed_units, 2);

        // Terminal records are never touched again.
        assert!(store.finish("ok", TaskOutcome::Cancelled).unwrap().is_none());
        assert_eq!(store.get("ok").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_paths() {
        let store = TaskStore::in_memory();
        store.insert(record("queued")).unwrap();
        store.insert(record("running")).unwrap();
        store.claim("running").unwrap();

        let cancelled = store.cancel_if_queued("queued").unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
        assert!(store.claim("queued").unwrap().is_none());

        assert!(store.cancel_if_queued("running").unwrap().is_none());
        let flagged = store.request_cancel("running").unwrap().unwrap();
        assert_eq!(flagged.status, TaskStatus::Running);
        assert!(store.is_cancel_requested("running"));
    }

    #[test]
    fn list_is_newest_first_and_keeps_active() {
        let store = TaskStore::in_memory();
        for id in ["old-active", "t1", "t2", "t3"] {
            store.insert(record(id)).unwrap();
        }
        for id in ["t1", "t2", "t3"] {
            store.claim(id).unwrap();
            store.finish(id, TaskOutcome::Completed).unwrap();
        }

        let ids: Vec<String> = store.list(2).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t3", "t2", "old-active"]);
    }

    #[test]
    fn clear_completed_keeps_others() {
        let store = TaskStore::in_memory();
        for id in ["done", "failed", "queued"] {
            store.insert(record(id)).unwrap();
        }
        store.claim("done").unwrap();
        store.finish("done", TaskOutcome::Completed).unwrap();
        store.claim("failed").unwrap();
        store.finish("failed", TaskOutcome::Failed("x".into())).unwrap();

        assert_eq!(store.clear_completed().unwrap(), 1);
        assert!(store.get("done").is_none());
        assert!(store.get("failed").is_some());
        assert!(store.get("queued").is_some());
    }

    #[test]
    fn reopen_marks_stale_tasks_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(TASKS_DIR_NAME);

        {
            let store = TaskStore::open(&path).unwrap();
            store.insert(record("queued")).unwrap();
            store.insert(record("running")).unwrap();
            store.insert(record("done")).unwrap();
            store.claim("running").unwrap();
            store.set_total_units("running", 10).unwrap();
            store.record_progress("running", 4, Some("/dst/a".into())).unwrap();
            store.claim("done").unwrap();
            store.finish("done", TaskOutcome::Completed).unwrap();
        }

        // Leftover from a write that never got renamed.
        fs::write(path.join(".queued.json.tmp"), "{ half").unwrap();

        let store = TaskStore::open(&path).unwrap();
        assert_eq!(store.reconcile_interrupted().unwrap(), 2);

        let running = store.get("running").unwrap();
        assert_eq!(running.status, TaskStatus::Interrupted);
        assert_eq!(running.processed_units, 4);
        assert_eq!(running.current_item, None);
        assert!(running.finished_at.is_some());
        assert_eq!(store.get("queued").unwrap().status, TaskStatus::Interrupted);
        assert_eq!(store.get("done").unwrap().status, TaskStatus::Completed);
        assert!(store.claim("queued").unwrap().is_none());

        // Sequence numbers keep growing across reopen.
        let fresh = store.insert(record("fresh")).unwrap();
        assert_eq!(fresh.sequence, 3);
        assert_eq!(store.list(1)[0].id, "fresh");
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TASKS_DIR_NAME);
        fs::create_dir(&path).unwrap();
        fs::write(path.join("broken.json"), "{ not json").unwrap();

        assert!(matches!(TaskStore::open(&path), Err(EngineError::Store(_))));
    }

    #[test]
    fn updates_rewrite_only_their_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TASKS_DIR_NAME);
        let store = TaskStore::open(&path).unwrap();
        store.insert(record("busy")).unwrap();
        store.insert(record("idle")).unwrap();

        // Edit the idle record behind the store's back; a whole-table rewrite would undo it.
        let idle_path = path.join("idle.json");
        let mut idle: TaskRecord = serde_json::from_str(&fs::read_to_string(&idle_path).unwrap()).unwrap();
        idle.error = Some("edited on disk".to_string());
        fs::write(&idle_path, serde_json::to_string(&idle).unwrap()).unwrap();

        store.claim("busy").unwrap();
        store.set_total_units("busy", 100).unwrap();
        for processed in 1..=100 {
            store.record_progress("busy", processed, None).unwrap();
        }
        store.finish("busy", TaskOutcome::Completed).unwrap();

        let reopened = TaskStore::open(&path).unwrap();
        assert_eq!(reopened.get("idle").unwrap().error.as_deref(), Some("edited on disk"));
        assert_eq!(reopened.get("busy").unwrap().processed_units, 100);

        assert_eq!(reopened.clear_completed().unwrap(), 1);
        assert!(!path.join("busy.json").exists());
        assert!(idle_path.exists());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the directory should be makes every write fail.
        let path = dir.path().join(TASKS_DIR_NAME);
        let store = TaskStore::open(&path).unwrap();
        fs::write(&path, b"occupied").unwrap();

        assert!(store.insert(record("t1")).is_err());
        assert!(store.get("t1").is_none());
        assert!(store.list(10).is_empty());
    }
}
