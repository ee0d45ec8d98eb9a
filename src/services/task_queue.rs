//! In-process FIFO and the single worker thread that drains it.
//!
//! The worker pops one task id at a time, claims it in the store
//! (`queued → running`), runs every entry through the transfer engine while
//! persisting each progress update, and finalizes the record. A failing or
//! panicking task is recorded and the loop moves on to the next id.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result, TransferError};
use crate::services::file_ops::{count_units, transfer_entry, ProgressSink};
use crate::services::overwrite::replace_with_backup;
use crate::services::path_guard::PathGuard;
use crate::services::plan::TransferPlan;
use crate::services::task::{TaskRecord, TaskStatus};
use crate::services::task_store::{TaskOutcome, TaskStore};

const WORKER_THREAD_NAME: &str = "panedir-transfer";

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    shutdown: bool,
}

/// FIFO of task ids waiting for the worker.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` unless it is already waiting. Returns whether it was added.
    pub fn push(&self, id: &str) -> bool {
        let mut state = self.lock();
        if state.shutdown || state.pending.iter().any(|queued| queued == id) {
            return false;
        }
        state.pending.push_back(id.to_string());
        self.ready.notify_one();
        true
    }

    /// Drop `id` from the queue. Returns whether it was waiting.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.pending.len();
        state.pending.retain(|queued| queued != id);
        state.pending.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until an id is available. `None` once the queue is shut down.
    fn pop_blocking(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(id) = state.pending.pop_front() {
                return Some(id);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn shutdown(&self) {
        self.lock().shutdown = true;
        self.ready.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns the queue and the worker thread. Dropping it stops the worker after
/// the task in flight; ids still waiting stay `queued` in the store and are
/// turned into `interrupted` by the next startup.
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker thread.
    pub fn start(store: Arc<TaskStore>, guard: PathGuard, reserved: Option<PathBuf>) -> Result<Self> {
        let queue = Arc::new(TaskQueue::new());
        let worker = Worker {
            store,
            guard,
            reserved,
        };

        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn({
                let queue = Arc::clone(&queue);
                move || worker.run(&queue)
            })?;

        Ok(Self {
            queue,
            worker: Some(handle),
        })
    }

    pub fn enqueue(&self, id: &str) -> bool {
        self.queue.push(id)
    }

    pub fn dequeue(&self, id: &str) -> bool {
        self.queue.remove(id)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stop the worker once the current task is done and wait for it.
    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("transfer worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    store: Arc<TaskStore>,
    guard: PathGuard,
    reserved: Option<PathBuf>,
}

impl Worker {
    fn run(&self, queue: &TaskQueue) {
        debug!("transfer worker started");
        while let Some(id) = queue.pop_blocking() {
            self.process(&id);
        }
        debug!("transfer worker stopped");
    }

    fn process(&self, id: &str) {
        let record = match self.store.claim(id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(task_id = %id, "task no longer queued, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to claim task");
                return;
            }
        };

        info!(
            task_id = %id,
            operation = record.operation.as_str(),
            source = %record.source_path,
            target = %record.target_path,
            entries = record.names.len(),
            "task started"
        );

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&record))) {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(EngineError::Transfer(TransferError::Cancelled))) => TaskOutcome::Cancelled,
            Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
            Err(_) => TaskOutcome::Failed("transfer aborted unexpectedly".to_string()),
        };

        match self.store.finish(id, outcome) {
            Ok(Some(finished)) => log_finished(&finished),
            Ok(None) => warn!(task_id = %id, "task left running state before it could be finalized"),
            Err(e) => error!(task_id = %id, error = %e, "failed to finalize task"),
        }
    }

    fn execute(&self, record: &TaskRecord) -> Result<()> {
        let plan = TransferPlan::prepare(
            &self.guard,
            self.reserved.as_deref(),
            record.operation,
            &record.source_path,
            &record.target_path,
            &record.names,
            &record.overwrite_names,
        )?;

        let mut total = 0;
        for entry in &plan.entries {
            total += count_units(&entry.source)?;
        }
        self.store.set_total_units(&record.id, total)?;
        debug!(task_id = %record.id, total_units = total, "units counted");

        let mut sink = StoreProgress {
            store: &self.store,
            guard: &self.guard,
            task_id: &record.id,
            processed: 0,
        };

        for entry in &plan.entries {
            if entry.overwrite {
                replace_with_backup(&entry.destination, || {
                    transfer_entry(plan.operation, &entry.source, &entry.destination, &mut sink)
                })?;
            } else {
                transfer_entry(plan.operation, &entry.source, &entry.destination, &mut sink)?;
            }
        }
        Ok(())
    }
}

fn log_finished(record: &TaskRecord) {
    match record.status {
        TaskStatus::Completed => info!(
            task_id = %record.id,
            units = record.total_units,
            "task completed"
        ),
        TaskStatus::Cancelled => info!(
            task_id = %record.id,
            processed = record.processed_units,
            total = record.total_units,
            "task cancelled"
        ),
        _ => warn!(
            task_id = %record.id,
            status = record.status.as_str(),
            error = record.error.as_deref().unwrap_or_default(),
            "task failed"
        ),
    }
}

/// Persists every unit before the engine is allowed to continue.
struct StoreProgress<'a> {
    store: &'a TaskStore,
    guard: &'a PathGuard,
    task_id: &'a str,
    processed: u64,
}

impl ProgressSink for StoreProgress<'_> {
    fn is_cancelled(&self) -> bool {
        self.store.is_cancel_requested(self.task_id)
    }

    fn advance(&mut self, item: &Path, units: u64) -> std::result::Result<(), TransferError> {
        self.processed += units;
        let current = self.guard.to_relative(item).ok();
        self.store
            .record_progress(self.task_id, self.processed, current)
            .map_err(|e| TransferError::Progress(e.to_string()))
    }
}
