//! Content digest of a working tree, used to detect no-op runs.

use carve_core::{CarveError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// SHA-256 over every file's path, mode and contents, in path order.
/// `.git` directories are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeDigest(String);

struct Entry {
    path: String,
    mode: &'static str,
    hash: String,
}

impl TreeDigest {
    pub fn compute(root: &Path) -> Result<Self> {
        let walker = ignore::WalkBuilder::new(root)
            .standard_filters(false)
            .filter_entry(|e| e.file_name() != ".git")
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| CarveError::Io {
                path: root.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;
            if entry.file_type().is_some_and(|t| !t.is_dir()) {
                files.push(entry.into_path());
            }
        }

        let mut entries = files
            .par_iter()
            .map(|path| hash_entry(root, path))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.path.as_bytes());
            hasher.update([0]);
            hasher.update(entry.mode.as_bytes());
            hasher.update([0]);
            hasher.update(entry.hash.as_bytes());
            hasher.update(b"\n");
        }
        let digest = Self(format!("{:x}", hasher.finalize()));
        tracing::debug!("digest of {} files: {digest}", entries.len());
        Ok(digest)
    }

    /// Accepts a 64-character lowercase hex string.
    pub fn parse(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)))
            .then(|| Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TreeDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash_entry(root: &Path, path: &Path) -> Result<Entry> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let meta = std::fs::symlink_metadata(path).map_err(|e| CarveError::io(path, e))?;
    let (mode, bytes) = if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| CarveError::io(path, e))?;
        ("120000", target.to_string_lossy().into_owned().into_bytes())
    } else {
        let bytes = std::fs::read(path).map_err(|e| CarveError::io(path, e))?;
        (file_mode(&meta), bytes)
    };

    Ok(Entry {
        path: rel,
        mode,
        hash: format!("{:x}", Sha256::digest(&bytes)),
    })
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> &'static str {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        "100755"
    } else {
        "100644"
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> &'static str {
    "100644"
}
