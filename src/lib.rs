//! Background copy/move engine for a dual-pane file manager.
//!
//! Transfers run on a single worker thread, report persisted progress, survive
//! restarts as `interrupted` records, and deletions go through a restorable trash.

pub mod config;
pub mod error;
pub mod logging;
pub mod services;

pub use error::{EngineError, Result, TransferError};
pub use services::engine::{EngineConfig, TransferEngine};
pub use services::file_ops::FileOperationType;
pub use services::task::{NewTransfer, TaskRecord, TaskStatus};
pub use services::trash::{DeleteOutcome, TrashEntry};
