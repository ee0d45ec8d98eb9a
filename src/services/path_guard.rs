//! Root-confined path resolution.
//!
//! Every path the engine receives is relative to a single root directory.
//! `PathGuard` turns those strings into absolute paths and refuses anything
//! that would land outside the root, whether through `..` components or
//! through a symlinked directory on the way.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result};

/// Maximum filename length (POSIX limit)
const MAX_FILENAME_LENGTH: usize = 255;

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Canonicalizes `root`; it must exist and be a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EngineError::NotFound(root.display().to_string())
            } else {
                EngineError::Io(e)
            }
        })?;
        if !canonical.is_dir() {
            return Err(EngineError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a root-relative path (`""`, `/`, `a/b` or `/a/b`) to an absolute path.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.contains('\0') {
            return Err(EngineError::InvalidPath(relative.to_string()));
        }

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in Path::new(relative).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => parts.push(part),
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(EngineError::OutsideRoot(relative.to_string()));
                    }
                }
                Component::Prefix(_) => {
                    return Err(EngineError::InvalidPath(relative.to_string()));
                }
            }
        }

        let mut resolved = self.root.clone();
        for part in &parts {
            resolved.push(part);
        }

        self.ensure_ancestors_inside(&resolved, relative)?;
        Ok(resolved)
    }

    /// Resolve an existing directory. Symlinks are followed all the way and the
    /// canonical result must still be under the root.
    pub fn resolve_dir(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        let canonical = path.canonicalize().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::NotFound(relative.to_string()),
            _ => EngineError::Io(e),
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(EngineError::OutsideRoot(relative.to_string()));
        }
        if !canonical.is_dir() {
            return Err(EngineError::NotADirectory(relative.to_string()));
        }
        Ok(canonical)
    }

    /// Resolve the directory `dir` and join a validated entry name onto it.
    /// Only the entry itself may be a symlink; it is not followed.
    pub fn resolve_entry(&self, dir: &str, name: &str) -> Result<PathBuf> {
        validate_entry_name(name)?;
        Ok(self.resolve_dir(dir)?.join(name))
    }

    /// Render an absolute path under the root as `/a/b` (the root itself is `/`).
    pub fn to_relative(&self, absolute: &Path) -> Result<String> {
        let stripped = absolute
            .strip_prefix(&self.root)
            .map_err(|_| EngineError::OutsideRoot(absolute.display().to_string()))?;

        let mut rendered = String::new();
        for component in stripped.components() {
            match component {
                Component::Normal(part) => {
                    rendered.push('/');
                    rendered.push_str(&part.to_string_lossy());
                }
                _ => return Err(EngineError::InvalidPath(absolute.display().to_string())),
            }
        }
        if rendered.is_empty() {
            rendered.push('/');
        }
        Ok(rendered)
    }

    /// The final component is left alone so a symlink entry can be handled as itself;
    /// everything above it must canonicalize to somewhere under the root.
    fn ensure_ancestors_inside(&self, resolved: &Path, original: &str) -> Result<()> {
        if resolved == self.root {
            return Ok(());
        }
        let Some(mut ancestor) = resolved.parent() else {
            return Ok(());
        };

        loop {
            match ancestor.canonicalize() {
                Ok(canonical) => {
                    if canonical.starts_with(&self.root) {
                        return Ok(());
                    }
                    return Err(EngineError::OutsideRoot(original.to_string()));
                }
                Err(_) => match ancestor.parent() {
                    Some(parent) => ancestor = parent,
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Validate a single entry name (a direct child of some directory).
pub fn validate_entry_name(name: &str) -> Result<()> {
    let invalid = |reason: &'static str| EngineError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("name cannot contain path separators"));
    }
    if name.contains('\0') {
        return Err(invalid("name cannot contain null bytes"));
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(invalid("name too long (max 255 bytes)"));
    }
    Ok(())
}

/// True when `path` exists, without following a trailing symlink.
pub fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
