//! Tree Pruner: decide which paths go, check the decision is safe, apply it.

use crate::locations::CrateLocations;
use crate::tree::TreeView;
use carve_core::config::PruneConfig;
use carve_core::graph::{DependencyGraph, KeepSet};
use carve_core::manifest::MANIFEST_FILE;
use carve_core::{CarveError, Result, paths};
use globset::GlobSet;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Top-level entries never scheduled, whatever the globs say.
const PROTECTED: [&str; 2] = [".git", MANIFEST_FILE];

/// A kept crate moving to a new directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Move {
    pub crate_name: String,
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Root-relative deletions, sorted and free of nested duplicates, plus moves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrunePlan {
    pub deletions: Vec<PathBuf>,
    pub moves: Vec<Move>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    /// Scheduled paths that were already gone.
    pub missing: Vec<PathBuf>,
    pub moved: Vec<Move>,
}

/// Plan the deletions and moves that reduce the tree to `keep`.
pub fn plan_prune(
    graph: &DependencyGraph,
    keep: &KeepSet,
    config: &PruneConfig,
    locations: &CrateLocations,
    tree: &dyn TreeView,
) -> Result<PrunePlan> {
    let exclude = config.exclude_set().map_err(config_error)?;
    let essential = config.essential_set().map_err(config_error)?;
    let protected: Vec<&Path> = keep
        .kept(graph)
        .into_iter()
        .map(|r| r.dir.as_path())
        .collect();

    let mut targets = BTreeSet::new();
    for record in keep.pruned(graph) {
        schedule(&record.dir, &protected, tree, &mut targets)?;
    }
    for entry in tree.children(Path::new(""))? {
        let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if PROTECTED.contains(&name) {
            continue;
        }
        if exclude.is_match(name) && !essential.is_match(name) {
            schedule(&entry, &protected, tree, &mut targets)?;
        }
    }

    if config.cleans_crates() {
        let cleanup = CrateCleanup {
            exclude: config.crate_exclude_set().map_err(config_error)?,
            symlinks: config.crate_symlinks,
            keep: config
                .crate_keep
                .iter()
                .filter_map(|p| paths::normalize(Path::new(p)))
                .collect(),
            crates: &protected,
        };
        for record in keep.kept(graph) {
            let mut keep_files = cleanup.keep.clone();
            // Files the manifest points at stay with it.
            keep_files.push(record.manifest_path());
            for file in [&record.readme, &record.license_file].into_iter().flatten() {
                keep_files.extend(paths::normalize(&record.dir.join(file)));
            }
            cleanup.scan(&record.dir, &keep_files, tree, &mut targets)?;
        }
    }

    let plan = PrunePlan {
        deletions: collapse(targets),
        moves: locations
            .moves(graph)
            .into_iter()
            .map(|(name, from, to)| Move {
                crate_name: name.to_string(),
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            })
            .collect(),
    };
    tracing::debug!(
        "prune plan: {} deletions, {} moves",
        plan.deletions.len(),
        plan.moves.len()
    );
    Ok(plan)
}

fn config_error(e: impl std::fmt::Display) -> CarveError {
    CarveError::Config(format!("{e:#}"))
}

/// Schedule `path` for deletion unless a kept crate lives at or under it.
/// Ancestors of kept crates are split into their children instead.
fn schedule(
    path: &Path,
    protected: &[&Path],
    tree: &dyn TreeView,
    out: &mut BTreeSet<PathBuf>,
) -> Result<()> {
    if path.as_os_str().is_empty() || protected.iter().any(|kept| paths::is_within(path, kept)) {
        return Ok(());
    }
    if protected.iter().any(|kept| paths::is_strict_ancestor(path, kept)) {
        for child in tree.children(path)? {
            schedule(&child, protected, tree, out)?;
        }
        return Ok(());
    }
    out.insert(path.to_path_buf());
    Ok(())
}

/// Per-crate cleanup inside kept crates.
struct CrateCleanup<'a> {
    exclude: GlobSet,
    symlinks: bool,
    keep: Vec<PathBuf>,
    /// Directories of every kept crate; each one is cleaned on its own.
    crates: &'a [&'a Path],
}

impl CrateCleanup<'_> {
    fn scan(
        &self,
        dir: &Path,
        keep_files: &[PathBuf],
        tree: &dyn TreeView,
        out: &mut BTreeSet<PathBuf>,
    ) -> Result<()> {
        for child in tree.children(dir)? {
            if self.crates.contains(&child.as_path()) || keep_files.contains(&child) {
                continue;
            }
            let guards_kept_file = keep_files.iter().any(|f| paths::is_strict_ancestor(&child, f));
            let name = child.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let doomed = (self.symlinks && tree.is_symlink(&child)?) || self.exclude.is_match(name);
            if doomed && !guards_kept_file {
                out.insert(child);
            } else {
                self.scan(&child, keep_files, tree, out)?;
            }
        }
        Ok(())
    }
}

/// Drop targets already covered by a scheduled ancestor. `Path` ordering is
/// component-wise, so ancestors come first.
fn collapse(targets: BTreeSet<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for target in targets {
        if !out.iter().any(|kept| paths::is_within(&target, kept)) {
            out.push(target);
        }
    }
    out
}

fn unsafe_target(path: &Path, reason: impl Into<String>) -> CarveError {
    CarveError::UnsafeDeletionTarget {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// `rel` must be a plain relative path whose existing parent resolves inside
/// `canonical_root`, so following symlinks cannot leave the tree.
fn check_contained(root: &Path, canonical_root: &Path, rel: &Path) -> Result<()> {
    if rel.as_os_str().is_empty() {
        return Err(unsafe_target(rel, "empty path would target the repository root"));
    }
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(unsafe_target(rel, "path must be relative without `.` or `..`"));
    }
    // The entry itself may be a symlink, which is removed and never
    // followed; what matters is the closest existing ancestor.
    let full = root.join(rel);
    let mut existing = full.parent();
    while let Some(dir) = existing
        && !dir.exists()
    {
        existing = dir.parent();
    }
    let existing = existing.unwrap_or(root);
    let resolved = existing
        .canonicalize()
        .map_err(|e| CarveError::io(existing, e))?;
    if !resolved.starts_with(canonical_root) {
        return Err(unsafe_target(
            rel,
            format!("resolves to {}, outside the repository", resolved.display()),
        ));
    }
    Ok(())
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.moves.is_empty()
    }

    /// Check every target before anything is touched.
    pub fn validate(&self, root: &Path) -> Result<()> {
        let canonical_root = root.canonicalize().map_err(|e| CarveError::io(root, e))?;
        for target in &self.deletions {
            check_contained(root, &canonical_root, target)?;
        }
        for mv in &self.moves {
            check_contained(root, &canonical_root, &mv.from)?;
            check_contained(root, &canonical_root, &mv.to)?;
            let freed = self.deletions.iter().any(|d| paths::is_within(&mv.to, d));
            if !freed && std::fs::symlink_metadata(root.join(&mv.to)).is_ok() {
                return Err(unsafe_target(
                    &mv.to,
                    format!("destination for `{}` already exists", mv.crate_name),
                ));
            }
        }
        Ok(())
    }

    /// Validate, then delete and move. Missing targets are skipped.
    pub fn apply(&self, root: &Path) -> Result<PruneReport> {
        self.validate(root)?;
        let mut report = PruneReport::default();

        for target in &self.deletions {
            let full = root.join(target);
            let meta = match std::fs::symlink_metadata(&full) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.missing.push(target.clone());
                    continue;
                }
                Err(e) => return Err(CarveError::io(full, e)),
            };
            let removed = if meta.is_dir() {
                std::fs::remove_dir_all(&full)
            } else {
                std::fs::remove_file(&full)
            };
            removed.map_err(|e| CarveError::io(&full, e))?;
            report.deleted.push(target.clone());
        }

        for mv in &self.moves {
            let to = root.join(&mv.to);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CarveError::io(parent, e))?;
            }
            std::fs::rename(root.join(&mv.from), &to).map_err(|e| CarveError::io(&to, e))?;
            tracing::info!("moved `{}` to {}", mv.crate_name, mv.to.display());
            report.moved.push(mv.clone());
        }

        tracing::info!(
            "pruned {} paths ({} already absent)",
            report.deleted.len(),
            report.missing.len()
        );
        Ok(report)
    }
}
