//! Cross-run exclusion through an exclusively created lock file.

use crate::transport::RunLock;
use carve_core::{CarveError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Create `path` exclusively. An existing lock older than `stale_after`
    /// is assumed abandoned and broken once.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        match Self::create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !is_stale(path, stale_after) {
                    return Err(CarveError::RunLocked {
                        path: path.to_path_buf(),
                    });
                }
                tracing::warn!("breaking stale lock {}", path.display());
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CarveError::io(path, e)),
                }
                Self::create(path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::AlreadyExists => CarveError::RunLocked {
                        path: path.to_path_buf(),
                    },
                    _ => CarveError::io(path, e),
                })
            }
            Err(e) => Err(CarveError::io(path, e)),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        Self::create_with(path, write_owner)
    }

    /// Create the file and fill it with `write`. A file that could not be
    /// filled is removed again so it never blocks later runs.
    fn create_with(
        path: &Path,
        write: impl FnOnce(&mut std::fs::File) -> std::io::Result<()>,
    ) -> std::io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        if let Err(e) = write(&mut file) {
            drop(file);
            if let Err(rm) = std::fs::remove_file(path) {
                tracing::warn!("failed to remove half-written lock {}: {rm}", path.display());
            }
            return Err(e);
        }
        tracing::debug!("acquired run lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}

/// Pid on the first line, acquisition time on the second.
fn write_owner(out: &mut std::fs::File) -> std::io::Result<()> {
    writeln!(out, "{}", std::process::id())?;
    writeln!(out, "{}", chrono::Utc::now().to_rfc3339())
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

/// [`RunLock`] backed by a [`FileLock`] at a fixed path.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    path: PathBuf,
    stale_after: Duration,
}

impl FileRunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }
}

impl RunLock for FileRunLock {
    type Guard = FileLock;

    fn acquire(&self) -> Result<FileLock> {
        FileLock::acquire(&self.path, self.stale_after)
    }
}
