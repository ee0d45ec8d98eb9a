use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure while transferring a single entry (one unit or one subtree).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Cancelled")]
    Cancelled,

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Target already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Cannot transfer '{}' into its own subtree", .0.display())]
    IntoOwnSubtree(PathBuf),

    #[error("Cannot transfer special file (device, socket, or pipe): {}", .0.display())]
    Unsupported(PathBuf),

    /// Cross-device move copied everything but the source could not be removed.
    /// Source and destination both hold the data now.
    #[error(
        "Moved '{}' to '{}' but could not delete the source: {source}",
        .source_path.display(),
        .destination.display()
    )]
    SourceCleanup {
        source_path: PathBuf,
        destination: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The rename already happened, so the data now lives only at the destination.
    #[error("Moved to '{}' but progress could not be recorded: {detail}", .destination.display())]
    MoveCommitted { destination: PathBuf, detail: String },

    #[error(
        "Destination '{}' was preserved with the new data; the previous entry was discarded. {detail}",
        .destination.display()
    )]
    DestinationPreserved { destination: PathBuf, detail: String },

    #[error(
        "Rollback of '{}' failed ({reason}); previous entry kept at '{}'. Original error: {cause}",
        .destination.display(),
        .backup.display()
    )]
    RollbackFailed {
        destination: PathBuf,
        backup: PathBuf,
        reason: String,
        cause: Box<TransferError>,
    },

    #[error("Failed to record progress: {0}")]
    Progress(String),
}

impl TransferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors surfaced by the engine's collaborator-facing operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path escapes the root directory: {0}")]
    OutsideRoot(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("No entries selected")]
    EmptySelection,

    #[error("Overwrite requested for '{0}' which is not part of the selection")]
    OverwriteNotSelected(String),

    #[error("Source and target are the same directory")]
    SameDirectory,

    #[error("Cannot transfer '{0}' into its own subtree")]
    IntoOwnSubtree(String),

    #[error("Cannot transfer into the trash: {0}")]
    TargetInTrash(String),

    #[error("Target already exists: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Trash entry not found: {0}")]
    TrashEntryMissing(String),

    #[error("Restore destination already exists: {0}")]
    RestoreConflict(String),

    #[error("Reserved trash directory cannot be moved or deleted: {0}")]
    ReservedPath(String),

    #[error("Task store error: {0}")]
    Store(String),

    #[error("Metadata parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
