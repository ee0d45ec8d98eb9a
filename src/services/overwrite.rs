//! Conflict detection and reversible overwrite.
//!
//! Callers resolve every conflict up front (skip or overwrite). An approved
//! overwrite moves the existing destination aside, runs the transfer, and puts
//! the original back if the transfer fails.

use std::fs;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::services::file_ops::remove_entry;
use crate::services::path_guard::entry_exists;

const BACKUP_MARKER: &str = "panedir-bak";
const BACKUP_SUFFIX_LEN: usize = 8;

/// Names from `names` that already exist inside `target_dir`.
pub fn find_conflicts<S: AsRef<str>>(target_dir: &Path, names: &[S]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.as_ref())
        .filter(|name| entry_exists(&target_dir.join(name)))
        .map(str::to_string)
        .collect()
}

/// A sibling of `dest` that does not exist yet.
pub fn backup_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = dest.parent().unwrap_or_else(|| Path::new(""));

    loop {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BACKUP_SUFFIX_LEN)
            .map(char::from)
            .collect();
        let candidate = parent.join(format!(".{}.{}-{}", name, BACKUP_MARKER, suffix));
        if !entry_exists(&candidate) {
            return candidate;
        }
    }
}

/// Run `transfer` so that it may replace `dest`, restoring the previous entry on failure.
///
/// - success: the backup is deleted.
/// - [`TransferError::SourceCleanup`] or [`TransferError::MoveCommitted`]: the destination
///   already holds the new data and may be the only copy left, so it is kept and the
///   backup is discarded.
/// - anything else (cancellation included): the partial destination is removed and
///   the backup renamed back before the original error is returned.
pub fn replace_with_backup<F>(dest: &Path, transfer: F) -> Result<(), TransferError>
where
    F: FnOnce() -> Result<(), TransferError>,
{
    if !entry_exists(dest) {
        return transfer();
    }

    let backup = backup_path_for(dest);
    fs::rename(dest, &backup).map_err(|e| TransferError::io(dest, e))?;
    debug!(
        destination = %dest.display(),
        backup = %backup.display(),
        "existing entry moved aside for overwrite"
    );

    match transfer() {
        Ok(()) => {
            discard_backup(&backup);
            Ok(())
        }
        Err(err @ (TransferError::SourceCleanup { .. } | TransferError::MoveCommitted { .. })) => {
            discard_backup(&backup);
            Err(TransferError::DestinationPreserved {
                destination: dest.to_path_buf(),
                detail: err.to_string(),
            })
        }
        Err(err) => Err(roll_back(dest, &backup, err)),
    }
}

fn roll_back(dest: &Path, backup: &Path, cause: TransferError) -> TransferError {
    let failed = |reason: String, cause: TransferError| TransferError::RollbackFailed {
        destination: dest.to_path_buf(),
        backup: backup.to_path_buf(),
        reason,
        cause: Box::new(cause),
    };

    if entry_exists(dest) {
        if let Err(e) = remove_entry(dest) {
            return failed(format!("could not remove partial destination: {}", e), cause);
        }
    }
    if let Err(e) = fs::rename(backup, dest) {
        return failed(format!("could not restore backup: {}", e), cause);
    }

    warn!(destination = %dest.display(), error = %cause, "overwrite rolled back");
    cause
}

fn discard_backup(backup: &Path) {
    if let Err(e) = remove_entry(backup) {
        warn!(backup = %backup.display(), error = %e, "failed to remove overwrite backup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::file_ops::{transfer_entry, FileOperationType, ProgressSink};
    use std::io;

    struct FailingSink;

    impl ProgressSink for FailingSink {
        fn is_cancelled(&self) -> bool {
            false
        }

        fn advance(&mut self, _item: &Path, _units: u64) -> Result<(), TransferError> {
            Err(TransferError::Progress("database is read-only".to_string()))
        }
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(BACKUP_MARKER))
            .collect()
    }

    #[test]
    fn finds_only_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let conflicts = find_conflicts(dir.path(), &["a.txt", "b.txt", "d"]);
        assert_eq!(conflicts, vec!["b.txt".to_string(), "d".to_string()]);
    }

    #[test]
    fn backup_path_is_hidden_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("report.pdf");
        let backup = backup_path_for(&dest);

        assert_eq!(backup.parent(), Some(dir.path()));
        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".report.pdf.panedir-bak-"));
        assert_ne!(backup_path_for(&dest), backup);
    }

    #[test]
    fn success_discards_backup() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.txt");
        fs::write(&dest, b"old").unwrap();

        replace_with_backup(&dest, || {
            fs::write(&dest, b"new").map_err(|e| TransferError::io(&dest, e))
        })
        .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn failure_mid_way_restores_original() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("folder");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep.txt"), b"original").unwrap();

        let result = replace_with_backup(&dest, || {
            // Partial artifact, then a failure.
            fs::create_dir(&dest).unwrap();
            fs::write(dest.join("half.txt"), b"partial").unwrap();
            Err(TransferError::io(
                dest.join("next.txt"),
                io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
            ))
        });

        assert!(matches!(result, Err(TransferError::Io { .. })));
        assert_eq!(fs::read(dest.join("keep.txt")).unwrap(), b"original");
        assert!(!dest.join("half.txt").exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn cancellation_also_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.txt");
        fs::write(&dest, b"old").unwrap();

        let result = replace_with_backup(&dest, || Err(TransferError::Cancelled));

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn source_cleanup_failure_keeps_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.txt");
        let src = dir.path().join("elsewhere.txt");
        fs::write(&dest, b"old").unwrap();

        let result = replace_with_backup(&dest, || {
            fs::write(&dest, b"new").unwrap();
            Err(TransferError::SourceCleanup {
                source_path: src.clone(),
                destination: dest.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
            })
        });

        match result {
            Err(TransferError::DestinationPreserved { destination, detail }) => {
                assert_eq!(destination, dest);
                assert!(detail.contains("could not delete the source"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn committed_move_survives_progress_failure() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("incoming");
        let dest = dir.path().join("target/incoming");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/data.txt"), b"new").unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("old.txt"), b"old").unwrap();

        let result = replace_with_backup(&dest, || {
            transfer_entry(FileOperationType::Move, &src, &dest, &mut FailingSink)
        });

        match result {
            Err(TransferError::DestinationPreserved { destination, detail }) => {
                assert_eq!(destination, dest);
                assert!(detail.contains("database is read-only"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!src.exists());
        assert_eq!(fs::read(dest.join("nested/data.txt")).unwrap(), b"new");
        assert!(!dest.join("old.txt").exists());
        assert!(leftovers(dest.parent().unwrap()).is_empty());
    }

    #[test]
    fn missing_destination_runs_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fresh.txt");

        let result = replace_with_backup(&dest, || Err(TransferError::Cancelled));
        assert!(result.unwrap_err().is_cancelled());
        assert!(!dest.exists());
        assert!(leftovers(dir.path()).is_empty());
    }
}
