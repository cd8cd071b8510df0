//! Dependency Graph Builder: crate-level graph over local path dependencies and
//! the closure (KeepSet) reachable from the root crate.

use crate::error::{CarveError, Result};
use crate::manifest::{CrateRecord, DepKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Directed graph: crate name → crates it depends on through local paths.
///
/// Every adjacency target is also a key of `records`; `build` fails otherwise.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    records: BTreeMap<String, CrateRecord>,
    adjacency: BTreeMap<String, BTreeSet<String>>,
    follow_dev: bool,
}

impl DependencyGraph {
    /// Build the graph from every record in the source tree.
    ///
    /// Normal and build dependencies are edges; dev-dependencies only when
    /// `follow_dev` is set. Each followed dependency must resolve, by
    /// directory, to a record declaring the expected package name.
    pub fn build(records: Vec<CrateRecord>, follow_dev: bool) -> Result<Self> {
        let mut by_name: BTreeMap<String, CrateRecord> = BTreeMap::new();
        let mut by_dir: HashMap<PathBuf, String> = HashMap::new();
        for record in records {
            if let Some(existing) = by_name.get(&record.name) {
                return Err(CarveError::CyclicDependency {
                    crate_name: record.name.clone(),
                    reason: format!(
                        "declared twice, in {} and {}",
                        existing.dir.display(),
                        record.dir.display()
                    ),
                });
            }
            by_dir.insert(record.dir.clone(), record.name.clone());
            by_name.insert(record.name.clone(), record);
        }

        let mut adjacency = BTreeMap::new();
        for record in by_name.values() {
            let mut targets = BTreeSet::new();
            for dep in &record.local_deps {
                if !follows(dep.table.kind(), follow_dev) {
                    continue;
                }
                let target = by_dir.get(&dep.path).ok_or_else(|| CarveError::CyclicDependency {
                    crate_name: record.name.clone(),
                    reason: format!(
                        "`{}` points at {}, which holds no crate in the source tree",
                        dep.key,
                        dep.path.display()
                    ),
                })?;
                if *target != dep.package {
                    return Err(CarveError::CyclicDependency {
                        crate_name: record.name.clone(),
                        reason: format!(
                            "`{}` expects package `{}` but {} declares `{}`",
                            dep.key,
                            dep.package,
                            dep.path.display(),
                            target
                        ),
                    });
                }
                targets.insert(target.clone());
            }
            adjacency.insert(record.name.clone(), targets);
        }

        Ok(Self {
            records: by_name,
            adjacency,
            follow_dev,
        })
    }

    /// The same graph minus edges declared under the given dependency keys,
    /// per crate name. An edge survives if another followed key still points
    /// at the same crate.
    #[must_use]
    pub fn without_dependencies(&self, dropped: &BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut graph = self.clone();
        for (name, keys) in dropped {
            let Some(record) = self.records.get(name) else {
                continue;
            };
            let remaining: BTreeSet<&str> = record
                .local_deps
                .iter()
                .filter(|d| follows(d.table.kind(), self.follow_dev) && !keys.contains(&d.key))
                .filter_map(|d| self.crate_at(&d.path))
                .map(|r| r.name.as_str())
                .collect();
            if let Some(targets) = graph.adjacency.get_mut(name) {
                targets.retain(|t| remaining.contains(t.as_str()));
            }
        }
        graph
    }

    /// Breadth-first closure from `root`. Each crate is visited once, so
    /// cycles terminate without special handling.
    pub fn keep_set(&self, root: &str) -> Result<KeepSet> {
        if !self.records.contains_key(root) {
            return Err(CarveError::Config(format!(
                "root crate `{root}` is not part of the source workspace"
            )));
        }

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(root.to_string());
        queue.push_back(root);

        while let Some(name) = queue.pop_front() {
            for dep in self.adjacency.get(name).into_iter().flatten() {
                if visited.insert(dep.clone()) {
                    queue.push_back(dep.as_str());
                }
            }
        }

        Ok(KeepSet {
            root: root.to_string(),
            crates: visited,
        })
    }

    pub fn record(&self, name: &str) -> Option<&CrateRecord> {
        self.records.get(name)
    }

    pub fn records(&self) -> impl Iterator<Item = &CrateRecord> {
        self.records.values()
    }

    /// Crate that lives at `dir`, if any.
    pub fn crate_at(&self, dir: &Path) -> Option<&CrateRecord> {
        self.records.values().find(|r| r.dir == dir)
    }

    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.adjacency.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn follows_dev(&self) -> bool {
        self.follow_dev
    }
}

/// Whether a dependency of this kind is a graph edge.
pub fn follows(kind: Option<DepKind>, follow_dev: bool) -> bool {
    match kind {
        Some(DepKind::Dev) => follow_dev,
        _ => true,
    }
}

/// The root crate plus everything transitively reachable from it.
/// Never empty; always contains the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeepSet {
    root: String,
    crates: BTreeSet<String>,
}

impl KeepSet {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn contains(&self, name: &str) -> bool {
        self.crates.contains(name)
    }

    pub fn crates(&self) -> &BTreeSet<String> {
        &self.crates
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.crates.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.crates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crates.is_empty()
    }

    /// Records of kept crates, sorted by name.
    pub fn kept<'g>(&self, graph: &'g DependencyGraph) -> Vec<&'g CrateRecord> {
        self.iter().filter_map(|n| graph.record(n)).collect()
    }

    /// Records of crates outside the closure, sorted by name.
    pub fn pruned<'g>(&self, graph: &'g DependencyGraph) -> Vec<&'g CrateRecord> {
        graph.records().filter(|r| !self.contains(&r.name)).collect()
    }
}
