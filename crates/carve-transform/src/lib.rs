//! Turns a full checkout into the kept subset: prune the tree, stub
//! configured macros and modules, then rewrite manifests so the subset is a
//! self-consistent workspace.
//!
//! Each stage plans first (pure, serializable) and applies second, so the
//! same code backs both `carve extract --dry-run` and real runs.

pub mod locations;
pub mod prune;
pub mod rewrite;
pub mod scan;
pub mod stub;
pub mod transform;
pub mod tree;

pub use locations::CrateLocations;
pub use prune::{PrunePlan, PruneReport};
pub use rewrite::{RewritePlan, RewriteReport};
pub use stub::StubPlan;
pub use transform::{Extraction, TransformReport, dry_run, transform};

use carve_core::{CarveError, Result};
use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents` through a sibling temp file and a rename,
/// keeping the original file's permissions.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CarveError::io(dir, e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| CarveError::io(tmp.path(), e))?;
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(|e| CarveError::io(path, e))?;
    }
    tmp.persist(path).map_err(|e| CarveError::io(path, e.error))?;
    Ok(())
}
