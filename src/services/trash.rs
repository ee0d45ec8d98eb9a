//! Recoverable deletes.
//!
//! Layout under the root:
//!
//! ```text
//! <trash>/files/<name>        trashed entries
//! <trash>/info/<name>.json    where each top-level entry came from
//! ```
//!
//! Metadata is only ever written after the entry physically landed in
//! `files`. Entries that disappear behind the API's back leave orphaned
//! metadata; it is tolerated and never swept.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::services::file_ops::{move_entry, remove_entry, EntryKind, NoProgress};
use crate::services::path_guard::{entry_exists, validate_entry_name, PathGuard};

pub const DEFAULT_TRASH_DIR_NAME: &str = ".trash";

const FILES_DIR: &str = "files";
const INFO_DIR: &str = "info";
const INFO_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashEntry {
    /// Current location, root-relative (`/.trash/files/report.pdf`).
    pub trash_path: String,
    /// Where the entry lived before it was deleted, root-relative.
    pub original_path: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Soft delete; the entry can be restored from `trash_path`.
    Trashed { trash_path: String },
    /// The entry was already in the trash and is gone for good.
    Purged,
}

#[derive(Debug, Clone)]
pub struct Trash {
    guard: PathGuard,
    root: PathBuf,
    files_dir: PathBuf,
    info_dir: PathBuf,
}

impl Trash {
    /// Open (and create if needed) the trash directories under the guard's root.
    pub fn open(guard: &PathGuard, dir_name: &str) -> Result<Self> {
        validate_entry_name(dir_name)?;
        let root = guard.root().join(dir_name);
        let trash = Self {
            guard: guard.clone(),
            files_dir: root.join(FILES_DIR),
            info_dir: root.join(INFO_DIR),
            root,
        };
        trash.ensure_layout()?;
        Ok(trash)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// True for the trash root and anything below it.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Delete `name` inside root-relative `dir`.
    ///
    /// Outside the trash this is a soft delete; inside it the entry is purged.
    pub fn delete_entry(&self, dir: &str, name: &str) -> Result<DeleteOutcome> {
        let path = self.guard.resolve_entry(dir, name)?;
        let relative = self.guard.to_relative(&path)?;

        if path == self.root || path == self.files_dir || path == self.info_dir {
            return Err(EngineError::ReservedPath(relative));
        }
        if !entry_exists(&path) {
            return Err(EngineError::NotFound(relative));
        }

        if self.contains(&path) {
            self.purge(&path)?;
            info!(path = %relative, "trash entry permanently deleted");
            return Ok(DeleteOutcome::Purged);
        }

        self.ensure_layout()?;
        let trash_name = self.free_name(name);
        let trashed = self.files_dir.join(&trash_name);
        self.relocate(&path, &trashed)?;

        let entry = TrashEntry {
            trash_path: self.guard.to_relative(&trashed)?,
            original_path: relative.clone(),
            deleted_at: Utc::now(),
        };
        if let Err(e) = self.write_info(&trash_name, &entry) {
            // Without metadata the entry could never be restored; undo the move.
            if let Err(undo) = self.relocate(&trashed, &path) {
                warn!(
                    path = %relative,
                    error = %undo,
                    "could not move entry back after metadata write failed"
                );
            }
            return Err(e);
        }

        info!(path = %relative, trash_path = %entry.trash_path, "entry moved to trash");
        Ok(DeleteOutcome::Trashed {
            trash_path: entry.trash_path,
        })
    }

    /// Put a top-level trash entry back where it came from. Returns the restored path.
    pub fn restore(&self, trash_path: &str) -> Result<String> {
        let path = self.guard.resolve(trash_path)?;
        let name = self
            .top_level_name(&path)
            .ok_or_else(|| EngineError::TrashEntryMissing(trash_path.to_string()))?;

        let entry = self
            .read_info(&name)?
            .ok_or_else(|| EngineError::TrashEntryMissing(trash_path.to_string()))?;
        if !entry_exists(&path) {
            return Err(EngineError::NotFound(trash_path.to_string()));
        }

        let original = self.guard.resolve(&entry.original_path)?;
        if entry_exists(&original) {
            return Err(EngineError::RestoreConflict(entry.original_path));
        }
        if self.contains(&original) {
            return Err(EngineError::InvalidPath(entry.original_path));
        }

        if let Some(parent) = original.parent() {
            fs::create_dir_all(parent)?;
        }
        self.relocate(&path, &original)?;
        self.remove_info(&name)?;

        info!(trash_path = %trash_path, path = %entry.original_path, "trash entry restored");
        Ok(entry.original_path)
    }

    /// Remove everything in the trash and leave an empty, usable layout behind.
    /// Returns the number of top-level entries purged.
    pub fn empty(&self) -> Result<usize> {
        let purged = match fs::read_dir(&self.files_dir) {
            Ok(entries) => entries.count(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        for dir in [&self.files_dir, &self.info_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.ensure_layout()?;

        info!(purged, "trash emptied");
        Ok(purged)
    }

    /// Metadata for every restorable entry, newest first.
    pub fn list(&self) -> Result<Vec<TrashEntry>> {
        let mut entries = Vec::new();
        let dir = match fs::read_dir(&self.info_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        for item in dir {
            let item = item?;
            let file_name = item.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(INFO_SUFFIX) else {
                continue;
            };
            match self.read_info(name) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(file = %file_name, error = %e, "skipping unreadable trash metadata"),
            }
        }

        entries.sort_by(|a, b| {
            b.deleted_at
                .cmp(&a.deleted_at)
                .then_with(|| a.trash_path.cmp(&b.trash_path))
        });
        Ok(entries)
    }

    fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.files_dir)?;
        fs::create_dir_all(&self.info_dir)?;
        Ok(())
    }

    fn purge(&self, path: &Path) -> Result<()> {
        remove_entry(path)?;
        if let Some(name) = self.top_level_name(path) {
            self.remove_info(&name)?;
        }
        Ok(())
    }

    /// Name of `path` when it is a direct child of the files area.
    fn top_level_name(&self, path: &Path) -> Option<String> {
        if path.parent() != Some(self.files_dir.as_path()) {
            return None;
        }
        path.file_name().map(|n| n.to_string_lossy().to_string())
    }

    /// `name`, then `stem (n).ext` / `name (n)`, free in both files and info.
    fn free_name(&self, name: &str) -> String {
        let is_free = |candidate: &str| {
            !entry_exists(&self.files_dir.join(candidate)) && !entry_exists(&self.info_path(candidate))
        };
        if is_free(name) {
            return name.to_string();
        }

        let (stem, ext) = split_extension(name);
        let mut n = 1u64;
        loop {
            let candidate = match ext {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            };
            if is_free(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Rename, falling back to copy + delete when the trash sits on another volume.
    fn relocate(&self, from: &Path, to: &Path) -> Result<()> {
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                let kind = EntryKind::detect(from)?;
                move_entry(from, to, kind, &mut NoProgress)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn info_path(&self, name: &str) -> PathBuf {
        self.info_dir.join(format!("{}{}", name, INFO_SUFFIX))
    }

    fn read_info(&self, name: &str) -> Result<Option<TrashEntry>> {
        match fs::read_to_string(self.info_path(name)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic write: temp file first, then rename.
    fn write_info(&self, name: &str, entry: &TrashEntry) -> Result<()> {
        let path = self.info_path(name);
        let temp_path = self.info_dir.join(format!(".{}{}.tmp", name, INFO_SUFFIX));
        let content = serde_json::to_string_pretty(entry)?;

        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove_info(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.info_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split `report.pdf` into (`report`, `pdf`). Dotfiles keep their leading dot in the stem.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}
