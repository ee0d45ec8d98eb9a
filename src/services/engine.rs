//! Operations offered to the rest of the application.
//!
//! Transfers are validated synchronously, persisted as `queued` records and
//! executed later by the background worker. Trash operations run inline.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::services::overwrite;
use crate::services::path_guard::PathGuard;
use crate::services::plan::TransferPlan;
use crate::services::task::{NewTransfer, TaskRecord};
use crate::services::task_queue::Scheduler;
use crate::services::task_store::TaskStore;
use crate::services::trash::{DeleteOutcome, Trash, TrashEntry, DEFAULT_TRASH_DIR_NAME};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Everything needed to open an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory all paths are relative to.
    pub root: PathBuf,
    /// Directory holding one record file per task. `None` keeps tasks in memory only.
    pub tasks_dir: Option<PathBuf>,
    pub trash_dir_name: String,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tasks_dir: None,
            trash_dir_name: DEFAULT_TRASH_DIR_NAME.to_string(),
        }
    }

    pub fn with_tasks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tasks_dir = Some(dir.into());
        self
    }
}

pub struct TransferEngine {
    guard: PathGuard,
    trash: Trash,
    store: Arc<TaskStore>,
    scheduler: Scheduler,
}

impl TransferEngine {
    /// Open the store, mark tasks left over from a previous run as
    /// interrupted, and start the worker.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let guard = PathGuard::new(&config.root)?;
        let trash = Trash::open(&guard, &config.trash_dir_name)?;
        let store = match &config.tasks_dir {
            Some(dir) => TaskStore::open(dir)?,
            None => TaskStore::in_memory(),
        };
        store.reconcile_interrupted()?;

        let store = Arc::new(store);
        let scheduler = Scheduler::start(
            Arc::clone(&store),
            guard.clone(),
            Some(trash.root().to_path_buf()),
        )?;

        info!(root = %guard.root().display(), "transfer engine started");
        Ok(Self {
            guard,
            trash,
            store,
            scheduler,
        })
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Validate and queue a copy/move. Returns the new task id.
    pub fn create_transfer_task(&self, request: NewTransfer) -> Result<String> {
        let plan = TransferPlan::prepare(
            &self.guard,
            Some(self.trash.root()),
            request.operation,
            &request.source_path,
            &request.target_path,
            &request.names,
            &request.overwrite_names,
        )?;

        let request = NewTransfer {
            source_path: self.guard.to_relative(&plan.source_dir)?,
            target_path: self.guard.to_relative(&plan.target_dir)?,
            ..request
        };
        let record = self
            .store
            .insert(TaskRecord::queued(Uuid::new_v4().to_string(), request))?;

        info!(
            task_id = %record.id,
            operation = record.operation.as_str(),
            source = %record.source_path,
            target = %record.target_path,
            entries = record.names.len(),
            overwrite = record.overwrite_names.len(),
            "task queued"
        );
        self.scheduler.enqueue(&record.id);
        Ok(record.id)
    }

    pub fn get_task(&self, id: &str) -> Option<TaskRecord> {
        self.store.get(id)
    }

    /// Newest first; active tasks are always included.
    pub fn list_tasks(&self, limit: usize) -> Vec<TaskRecord> {
        self.store.list(limit)
    }

    /// Cancel a queued task immediately or ask a running one to stop at the
    /// next unit. Terminal tasks are returned unchanged.
    pub fn cancel_task(&self, id: &str) -> Result<TaskRecord> {
        let current = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        if current.status.is_terminal() {
            debug!(task_id = %id, status = current.status.as_str(), "cancel ignored");
            return Ok(current);
        }

        if let Some(cancelled) = self.store.cancel_if_queued(id)? {
            self.scheduler.dequeue(id);
            info!(task_id = %id, "queued task cancelled");
            return Ok(cancelled);
        }

        let record = self
            .store
            .request_cancel(id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        info!(task_id = %id, status = record.status.as_str(), "cancellation requested");
        Ok(record)
    }

    /// Remove `completed` records. Returns how many were dropped.
    pub fn clear_completed_tasks(&self) -> Result<usize> {
        let removed = self.store.clear_completed()?;
        info!(removed, "completed tasks cleared");
        Ok(removed)
    }

    pub fn delete_entry(&self, dir: &str, name: &str) -> Result<DeleteOutcome> {
        self.trash.delete_entry(dir, name)
    }

    pub fn restore_trash_entry(&self, trash_path: &str) -> Result<String> {
        self.trash.restore(trash_path)
    }

    pub fn empty_trash(&self) -> Result<usize> {
        self.trash.empty()
    }

    pub fn list_trash(&self) -> Result<Vec<TrashEntry>> {
        self.trash.list()
    }

    /// Names that already exist in `target_dir`, in the order given.
    pub fn find_conflicts<S: AsRef<str>>(&self, target_dir: &str, names: &[S]) -> Result<Vec<String>> {
        let dir = self.guard.resolve_dir(target_dir)?;
        Ok(overwrite::find_conflicts(&dir, names))
    }

    /// Sorted entry names of a directory.
    pub fn list_entries(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.guard.resolve_dir(dir)?;
        let entries = fs::read_dir(&path)?;

        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Poll until the task is terminal or `timeout` elapses, then return its record.
    pub fn wait_for_task(&self, id: &str, timeout: Duration) -> Result<TaskRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self
                .store
                .get(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if record.status.is_terminal() || Instant::now() >= deadline {
                return Ok(record);
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.scheduler.pending()
    }

    /// Stop the worker after the task in flight.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}
