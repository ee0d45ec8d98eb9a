//! Validation of a copy/move request against the filesystem.
//!
//! The same checks run when a task is created and again right before the
//! worker starts it, so nothing that changed in between is transferred on
//! stale assumptions. Every check happens before the first byte moves.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::services::file_ops::FileOperationType;
use crate::services::path_guard::{entry_exists, validate_entry_name, PathGuard};

/// One top-level entry of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Replace an existing destination (pre-approved by the caller).
    pub overwrite: bool,
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub operation: FileOperationType,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub entries: Vec<PlannedEntry>,
}

impl TransferPlan {
    /// Resolve and validate a request. `reserved` is a subtree nothing may be transferred into.
    pub fn prepare(
        guard: &PathGuard,
        reserved: Option<&Path>,
        operation: FileOperationType,
        source_path: &str,
        target_path: &str,
        names: &[String],
        overwrite_names: &[String],
    ) -> Result<Self> {
        if names.is_empty() {
            return Err(EngineError::EmptySelection);
        }
        let mut seen = HashSet::new();
        for name in names {
            validate_entry_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(EngineError::DuplicateName(name.clone()));
            }
        }
        if let Some(name) = overwrite_names.iter().find(|n| !seen.contains(n.as_str())) {
            return Err(EngineError::OverwriteNotSelected(name.clone()));
        }

        // Canonical, so symlink aliases compare equal below.
        let source_dir = guard.resolve_dir(source_path)?;
        let target_dir = guard.resolve_dir(target_path)?;
        if source_dir == target_dir {
            return Err(EngineError::SameDirectory);
        }
        if reserved.is_some_and(|reserved| target_dir.starts_with(reserved)) {
            return Err(EngineError::TargetInTrash(target_path.to_string()));
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let source = source_dir.join(name);
            let destination = target_dir.join(name);
            let display = || guard.to_relative(&source).unwrap_or_else(|_| name.clone());

            let metadata = fs::symlink_metadata(&source).map_err(|_| EngineError::NotFound(display()))?;
            if reserved.is_some_and(|reserved| reserved.starts_with(&source) || source.parent() == Some(reserved)) {
                return Err(EngineError::ReservedPath(display()));
            }
            if metadata.is_dir() && target_dir.starts_with(&source) {
                return Err(EngineError::IntoOwnSubtree(display()));
            }

            let overwrite = overwrite_names.iter().any(|n| n == name);
            if entry_exists(&destination) {
                if !overwrite {
                    return Err(EngineError::Conflict(
                        guard.to_relative(&destination).unwrap_or_else(|_| name.clone()),
                    ));
                }
                // Moving the existing entry aside would drag the source along with it.
                if source_dir.starts_with(&destination) {
                    return Err(EngineError::IntoOwnSubtree(display()));
                }
            }

            entries.push(PlannedEntry {
                name: name.clone(),
                source,
                destination,
                overwrite,
            });
        }

        Ok(Self {
            operation,
            source_dir,
            target_dir,
            entries,
        })
    }
}
