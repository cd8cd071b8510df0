//! Directory listing abstraction so pruning can be planned without a disk.

use carve_core::{CarveError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Read-only view of a repository tree. Paths are root-relative; the empty
/// path is the root itself.
pub trait TreeView {
    /// Immediate children of `dir`, sorted. A missing directory has none.
    fn children(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    fn is_symlink(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }
}

/// The tree as it exists on disk under `root`.
pub struct FsTree {
    root: PathBuf,
}

impl FsTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TreeView for FsTree {
    fn children(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let full = self.root.join(dir);
        // Symlinks are leaves: never descend through them.
        match std::fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CarveError::io(full, e)),
        }

        let entries = std::fs::read_dir(&full).map_err(|e| CarveError::io(&full, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CarveError::io(&full, e))?;
            out.push(dir.join(entry.file_name()));
        }
        out.sort();
        Ok(out)
    }

    fn is_symlink(&self, path: &Path) -> Result<bool> {
        let full = self.root.join(path);
        match std::fs::symlink_metadata(&full) {
            Ok(meta) => Ok(meta.file_type().is_symlink()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CarveError::io(full, e)),
        }
    }
}

/// In-memory tree built from a list of file paths; directories are implied
/// by their descendants.
#[derive(Debug, Clone, Default)]
pub struct MemoryTree {
    entries: BTreeSet<PathBuf>,
}

impl MemoryTree {
    pub fn from_files<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut entries = BTreeSet::new();
        for file in files {
            let mut current = Some(file.as_ref());
            while let Some(path) = current {
                if path.as_os_str().is_empty() {
                    break;
                }
                entries.insert(path.to_path_buf());
                current = path.parent();
            }
        }
        Self { entries }
    }
}

impl TreeView for MemoryTree {
    fn children(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .entries
            .iter()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }
}
