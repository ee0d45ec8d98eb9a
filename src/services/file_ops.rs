//! Transfer execution: copy or move one entry (file, symlink or directory tree).
//!
//! Every unit (file, symlink, directory node) is reported to a [`ProgressSink`]
//! once it exists at the destination, before the walk goes any deeper. The sink
//! is also asked about cancellation before each unit starts, so a cancelled
//! transfer stops on a unit boundary and keeps whatever it already produced.
//!
//! Recursion depth is bounded by the OS path-length limit; no extra guard is kept.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransferError;
use crate::services::path_guard::entry_exists;

/// File operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationType {
    Copy,
    Move,
}

impl FileOperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Move => "move",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "copy" => Some(Self::Copy),
            "move" => Some(Self::Move),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Inspect `path` without following a trailing symlink.
    pub fn detect(path: &Path) -> Result<Self, TransferError> {
        let metadata = fs::symlink_metadata(path).map_err(|e| TransferError::io(path, e))?;
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            Ok(Self::Symlink)
        } else if file_type.is_dir() {
            Ok(Self::Directory)
        } else if file_type.is_file() {
            Ok(Self::File)
        } else {
            Err(TransferError::Unsupported(path.to_path_buf()))
        }
    }
}

/// Receiver of per-unit progress pushed by the engine.
pub trait ProgressSink {
    /// Polled before every unit. `true` stops the transfer with [`TransferError::Cancelled`].
    fn is_cancelled(&self) -> bool;

    /// `units` finished at `item` and are in place at the destination.
    /// The engine does not start the next unit until this returns.
    fn advance(&mut self, item: &Path, units: u64) -> Result<(), TransferError>;
}

/// Sink for callers that need neither progress nor cancellation.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn advance(&mut self, _item: &Path, _units: u64) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Count transfer units below (and including) `path`. Symlinks are not followed.
pub fn count_units(path: &Path) -> Result<u64, TransferError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| TransferError::io(path, e))?;
    if !metadata.is_dir() {
        return Ok(1);
    }

    let mut total = 1;
    for (child, _) in sorted_children(path)? {
        total += count_units(&child)?;
    }
    Ok(total)
}

/// Copy or move `src` to `dest` according to `operation`.
pub fn transfer_entry(
    operation: FileOperationType,
    src: &Path,
    dest: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<(), TransferError> {
    let kind = EntryKind::detect(src)?;
    match operation {
        FileOperationType::Copy => copy_entry(src, dest, kind, sink),
        FileOperationType::Move => move_entry(src, dest, kind, sink),
    }
}

/// Copy an entry of a known kind. Never replaces an existing destination.
pub fn copy_entry(
    src: &Path,
    dest: &Path,
    kind: EntryKind,
    sink: &mut dyn ProgressSink,
) -> Result<(), TransferError> {
    match kind {
        EntryKind::Directory => copy_dir(src, dest, sink),
        EntryKind::File => {
            check_cancelled(sink)?;
            copy_file(src, dest)?;
            sink.advance(dest, 1)
        }
        EntryKind::Symlink => {
            check_cancelled(sink)?;
            copy_symlink(src, dest)?;
            sink.advance(dest, 1)
        }
    }
}

/// Move an entry: rename when possible, copy + delete across devices.
pub fn move_entry(
    src: &Path,
    dest: &Path,
    kind: EntryKind,
    sink: &mut dyn ProgressSink,
) -> Result<(), TransferError> {
    if kind == EntryKind::Directory {
        ensure_not_into_self(src, dest)?;
    }
    check_cancelled(sink)?;

    // rename(2) silently replaces files; conflicts are decided one level up.
    if entry_exists(dest) {
        return Err(TransferError::DestinationExists(dest.to_path_buf()));
    }

    let units = count_units(src)?;
    match fs::rename(src, dest) {
        Ok(()) => sink.advance(dest, units).map_err(|e| TransferError::MoveCommitted {
            destination: dest.to_path_buf(),
            detail: e.to_string(),
        }),
        Err(e) if is_cross_device(&e) => {
            debug!(
                source = %src.display(),
                destination = %dest.display(),
                "rename crossed devices, falling back to copy and delete"
            );
            copy_then_remove(src, dest, kind, sink, remove_entry)
        }
        Err(e) => Err(TransferError::io(src, e)),
    }
}

/// Cross-device move. The source is only removed once the copy is complete.
fn copy_then_remove(
    src: &Path,
    dest: &Path,
    kind: EntryKind,
    sink: &mut dyn ProgressSink,
    remove: impl FnOnce(&Path) -> io::Result<()>,
) -> Result<(), TransferError> {
    copy_entry(src, dest, kind, sink)?;
    remove(src).map_err(|source| TransferError::SourceCleanup {
        source_path: src.to_path_buf(),
        destination: dest.to_path_buf(),
        source,
    })
}

/// Delete a file, symlink (never its referent) or directory tree.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;

    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn copy_dir(src: &Path, dest: &Path, sink: &mut dyn ProgressSink) -> Result<(), TransferError> {
    ensure_not_into_self(src, dest)?;
    check_cancelled(sink)?;

    let metadata = fs::metadata(src).map_err(|e| TransferError::io(src, e))?;
    fs::create_dir(dest).map_err(|e| exists_or_io(dest, e))?;
    sink.advance(dest, 1)?;

    for (child_src, name) in sorted_children(src)? {
        let child_dest = dest.join(&name);
        let kind = EntryKind::detect(&child_src)?;
        copy_entry(&child_src, &child_dest, kind, sink)?;
    }

    // Applied last so a read-only source directory can still be filled.
    fs::set_permissions(dest, metadata.permissions()).map_err(|e| TransferError::io(dest, e))
}

fn copy_file(src: &Path, dest: &Path) -> Result<(), TransferError> {
    let mut reader = File::open(src).map_err(|e| TransferError::io(src, e))?;
    let metadata = reader.metadata().map_err(|e| TransferError::io(src, e))?;

    let mut writer = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .map_err(|e| exists_or_io(dest, e))?;

    let copied = io::copy(&mut reader, &mut writer).and_then(|_| writer.flush());
    if let Err(e) = copied {
        // Clean up incomplete file
        drop(writer);
        let _ = fs::remove_file(dest);
        return Err(TransferError::io(src, e));
    }

    fs::set_permissions(dest, metadata.permissions()).map_err(|e| TransferError::io(dest, e))
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> Result<(), TransferError> {
    let link_target = fs::read_link(src).map_err(|e| TransferError::io(src, e))?;
    std::os::unix::fs::symlink(&link_target, dest).map_err(|e| exists_or_io(dest, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dest: &Path) -> Result<(), TransferError> {
    Err(TransferError::Unsupported(src.to_path_buf()))
}

fn check_cancelled(sink: &dyn ProgressSink) -> Result<(), TransferError> {
    if sink.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

fn ensure_not_into_self(src: &Path, dest: &Path) -> Result<(), TransferError> {
    if dest.starts_with(src) {
        return Err(TransferError::IntoOwnSubtree(src.to_path_buf()));
    }
    Ok(())
}

fn sorted_children(dir: &Path) -> Result<Vec<(PathBuf, OsString)>, TransferError> {
    let entries = fs::read_dir(dir).map_err(|e| TransferError::io(dir, e))?;

    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TransferError::io(dir, e))?;
        children.push((entry.path(), entry.file_name()));
    }
    children.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(children)
}

fn exists_or_io(path: &Path, e: io::Error) -> TransferError {
    if e.kind() == io::ErrorKind::AlreadyExists {
        TransferError::DestinationExists(path.to_path_buf())
    } else {
        TransferError::io(path, e)
    }
}

fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}
