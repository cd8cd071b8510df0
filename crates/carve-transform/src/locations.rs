//! Where each kept crate ends up once relocations are applied.

use carve_core::graph::{DependencyGraph, KeepSet};
use carve_core::{CarveError, Result, paths};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Kept crate name → final root-relative directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrateLocations {
    dirs: BTreeMap<String, PathBuf>,
}

impl CrateLocations {
    /// Every kept crate stays where it is.
    pub fn current(graph: &DependencyGraph, keep: &KeepSet) -> Self {
        let dirs = keep
            .kept(graph)
            .into_iter()
            .map(|r| (r.name.clone(), r.dir.clone()))
            .collect();
        Self { dirs }
    }

    /// Apply `relocate` (crate → destination directory) on top of the current
    /// layout. Relocations naming crates outside the KeepSet are ignored.
    pub fn resolve(
        graph: &DependencyGraph,
        keep: &KeepSet,
        relocate: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut locations = Self::current(graph, keep);

        for (name, dest) in relocate {
            if !keep.contains(name) {
                tracing::warn!("ignoring relocation of `{name}`: crate is not kept");
                continue;
            }
            let target = paths::normalize(Path::new(dest))
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| CarveError::UnsafeDeletionTarget {
                    path: PathBuf::from(dest),
                    reason: format!("relocation of `{name}` must name a directory inside the repository"),
                })?;

            locations.dirs.insert(name.clone(), target);
        }

        locations.check_disjoint(graph)?;
        Ok(locations)
    }

    /// Final directories must be distinct, and no crate may land inside the
    /// old directory of another crate that is itself being moved.
    fn check_disjoint(&self, graph: &DependencyGraph) -> Result<()> {
        let entries: Vec<(&String, &PathBuf)> = self.dirs.iter().collect();
        for (i, (a_name, a_dir)) in entries.iter().enumerate() {
            for (b_name, b_dir) in &entries[i + 1..] {
                if a_dir == b_dir {
                    return Err(CarveError::Config(format!(
                        "`{a_name}` and `{b_name}` would both live at {}",
                        a_dir.display()
                    )));
                }
            }
        }
        let moves = self.moves(graph);
        for (name, from, _) in &moves {
            if let Some((inner, _, _)) = moves
                .iter()
                .find(|(other, other_from, _)| other != name && paths::is_within(other_from, from))
            {
                return Err(CarveError::Config(format!(
                    "`{inner}` and `{name}` are nested and cannot both be relocated"
                )));
            }
        }
        for (name, from, _) in moves {
            if let Some((other, _)) = self
                .iter()
                .find(|(other, dir)| *other != name && paths::is_within(dir, from))
            {
                return Err(CarveError::Config(format!(
                    "`{other}` would end up inside {}, which moves with `{name}`",
                    from.display()
                )));
            }
        }
        Ok(())
    }

    pub fn dir_of(&self, name: &str) -> Option<&Path> {
        self.dirs.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.dirs.iter().map(|(n, d)| (n.as_str(), d.as_path()))
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Kept crate whose final directory is the deepest one containing `path`.
    pub fn owner_of(&self, path: &Path) -> Option<&str> {
        self.iter()
            .filter(|(_, dir)| paths::is_within(path, dir))
            .max_by_key(|(_, dir)| dir.components().count())
            .map(|(name, _)| name)
    }

    /// (crate, from, to) for every crate whose final directory differs from
    /// where it lives in `graph`.
    pub fn moves<'a>(&'a self, graph: &'a DependencyGraph) -> Vec<(&'a str, &'a Path, &'a Path)> {
        self.iter()
            .filter_map(|(name, dir)| {
                let record = graph.record(name)?;
                (record.dir != dir).then_some((name, record.dir.as_path(), dir))
            })
            .collect()
    }
}
