//! Manifest Rewriter: make the kept subset a self-consistent workspace.
//!
//! Planning is pure and works from the records read before pruning. Applying
//! edits the manifests in their final locations with `toml_edit`, so
//! comments, ordering and formatting outside the touched entries survive.

use crate::locations::CrateLocations;
use crate::stub::StubPlan;
use carve_core::graph::{DependencyGraph, KeepSet};
use carve_core::manifest::{
    DepTable, MANIFEST_FILE, ProfileOverride, WorkspaceManifest, read_crate, read_workspace,
};
use carve_core::{CarveError, Result, paths};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use toml_edit::{Array, DocumentMut, Item, TableLike, Value};

/// A path dependency whose relative path changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathUpdate {
    pub table: DepTable,
    pub key: String,
    pub old: String,
    pub new: String,
}

/// A dependency entry removed from a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub table: DepTable,
    pub key: String,
}

/// A `[package]` path field (`readme`, `license-file`) re-anchored after a move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageFieldUpdate {
    pub field: &'static str,
    pub old: String,
    pub new: String,
}

/// Everything that changes in one crate manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManifestEdit {
    /// Root-relative path of the manifest in its final location.
    pub manifest: PathBuf,
    pub path_updates: Vec<PathUpdate>,
    pub removals: Vec<Removal>,
    /// Feature name → values to drop from it.
    pub feature_edits: BTreeMap<String, BTreeSet<String>>,
    pub package_updates: Vec<PackageFieldUpdate>,
}

impl ManifestEdit {
    /// Old relative path → new relative path, per dependency path that changes.
    pub fn path_changes(&self) -> BTreeMap<&str, &str> {
        self.path_updates
            .iter()
            .map(|u| (u.old.as_str(), u.new.as_str()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.path_updates.is_empty()
            && self.removals.is_empty()
            && self.feature_edits.is_empty()
            && self.package_updates.is_empty()
    }
}

/// Changes to the root manifest's `[workspace]` section.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceEdit {
    /// Final member list, sorted.
    pub members: Vec<String>,
    /// Replacement for `default-members` when it changes; empty removes the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_members: Option<Vec<String>>,
    /// Replacement for `exclude` when it changes; empty removes the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    pub path_updates: Vec<PathUpdate>,
    pub removals: Vec<Removal>,
    /// `[profile.*.package.*]` overrides naming a pruned crate.
    pub profile_removals: Vec<ProfileOverride>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RewritePlan {
    pub workspace: WorkspaceEdit,
    /// Kept crate name → edit, only for manifests that change.
    pub crates: BTreeMap<String, ManifestEdit>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RewriteReport {
    pub written: Vec<PathBuf>,
    pub unchanged: usize,
}

/// Map a path recorded in the source layout to the final layout: anything
/// inside a kept crate's old directory moves with the crate.
fn relocate_path(graph: &DependencyGraph, locations: &CrateLocations, path: &Path) -> Option<PathBuf> {
    locations
        .iter()
        .filter_map(|(name, dir)| {
            let old = &graph.record(name)?.dir;
            let rest = path.strip_prefix(old).ok()?;
            Some((old.components().count(), dir.join(rest)))
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, p)| p)
}

/// Compute every manifest change needed once the tree holds only `keep`.
pub fn plan_rewrite(
    graph: &DependencyGraph,
    keep: &KeepSet,
    workspace: &WorkspaceManifest,
    locations: &CrateLocations,
    stubs: &StubPlan,
) -> RewritePlan {
    RewritePlan {
        workspace: plan_workspace(graph, keep, workspace, locations),
        crates: keep
            .kept(graph)
            .into_iter()
            .filter_map(|record| {
                let edit = plan_crate(graph, keep, locations, stubs, &record.name)?;
                (!edit.is_empty()).then(|| (record.name.clone(), edit))
            })
            .collect(),
    }
}

fn plan_workspace(
    graph: &DependencyGraph,
    keep: &KeepSet,
    workspace: &WorkspaceManifest,
    locations: &CrateLocations,
) -> WorkspaceEdit {
    let members: BTreeSet<String> = locations
        .iter()
        .map(|(_, dir)| paths::to_manifest_string(dir))
        .collect();

    // Entries pointing at pruned content disappear, the rest follow their crate.
    let remap = |entries: &[String]| -> Option<Vec<String>> {
        if entries.is_empty() {
            return None;
        }
        let kept: Vec<String> = entries
            .iter()
            .filter_map(|e| {
                let path = paths::normalize(Path::new(e))?;
                let moved = relocate_path(graph, locations, &path)?;
                Some(if moved == path {
                    e.clone()
                } else {
                    paths::to_manifest_string(&moved)
                })
            })
            .collect();
        (kept != entries).then_some(kept)
    };

    let mut edit = WorkspaceEdit {
        members: members.into_iter().collect(),
        default_members: remap(&workspace.default_members),
        exclude: remap(&workspace.exclude),
        ..WorkspaceEdit::default()
    };

    for dep in workspace.path_dependencies.values() {
        let target = graph
            .crate_at(&dep.path)
            .filter(|r| keep.contains(&r.name) && r.name == dep.package)
            .and_then(|r| locations.dir_of(&r.name));
        match target {
            Some(dir) if dir == dep.path => {}
            Some(dir) => edit.path_updates.push(PathUpdate {
                table: DepTable::Workspace,
                key: dep.key.clone(),
                old: dep.declared_path.clone(),
                new: paths::to_manifest_string(dir),
            }),
            None => edit.removals.push(Removal {
                table: DepTable::Workspace,
                key: dep.key.clone(),
            }),
        }
    }

    // Overrides for registry crates and `*` stay; cargo rejects the rest.
    edit.profile_removals = workspace
        .profile_overrides
        .iter()
        .filter(|o| graph.record(&o.package).is_some() && !keep.contains(&o.package))
        .cloned()
        .collect();
    edit
}

fn plan_crate(
    graph: &DependencyGraph,
    keep: &KeepSet,
    locations: &CrateLocations,
    stubs: &StubPlan,
    name: &str,
) -> Option<ManifestEdit> {
    let record = graph.record(name)?;
    let new_dir = locations.dir_of(name)?;
    let dropped = stubs.dropped_dependencies.get(name);
    let is_dropped = |key: &str| dropped.is_some_and(|d| d.contains(key));

    let mut edit = ManifestEdit {
        manifest: new_dir.join(MANIFEST_FILE),
        ..ManifestEdit::default()
    };
    let mut removed_keys = BTreeSet::new();

    for dep in &record.local_deps {
        if is_dropped(&dep.key) {
            removed_keys.insert(dep.key.clone());
            edit.removals.push(Removal {
                table: dep.table.clone(),
                key: dep.key.clone(),
            });
            continue;
        }
        let target = graph
            .crate_at(&dep.path)
            .filter(|t| keep.contains(&t.name) && t.name == dep.package)
            .and_then(|t| locations.dir_of(&t.name));
        match target {
            // Inherited entries are fixed once, in the workspace table.
            Some(_) if dep.via_workspace => {}
            Some(target_dir) => {
                let resolves_to = paths::normalize(&new_dir.join(&dep.declared_path));
                if resolves_to.as_deref() != Some(target_dir) {
                    edit.path_updates.push(PathUpdate {
                        table: dep.table.clone(),
                        key: dep.key.clone(),
                        old: dep.declared_path.clone(),
                        new: paths::to_manifest_string(&paths::relative(new_dir, target_dir)),
                    });
                }
            }
            None => {
                tracing::debug!("{name}: dropping `{}` from {}, target is pruned", dep.key, dep.table);
                removed_keys.insert(dep.key.clone());
                edit.removals.push(Removal {
                    table: dep.table.clone(),
                    key: dep.key.clone(),
                });
            }
        }
    }

    for dep in &record.external_deps {
        if is_dropped(&dep.key) {
            removed_keys.insert(dep.key.clone());
            edit.removals.push(Removal {
                table: dep.table.clone(),
                key: dep.key.clone(),
            });
        }
    }

    // A key removed from one table may still be declared in another one
    // (say, a target-specific table); its feature references stay valid then.
    let still_declared: BTreeSet<&str> = record
        .local_deps
        .iter()
        .map(|d| (&d.key, &d.table))
        .chain(record.external_deps.iter().map(|d| (&d.key, &d.table)))
        .filter(|(key, table)| {
            !edit
                .removals
                .iter()
                .any(|r| &&r.key == key && &&r.table == table)
        })
        .map(|(key, _)| key.as_str())
        .collect();
    for key in removed_keys.iter().filter(|k| !still_declared.contains(k.as_str())) {
        for (feature, value) in record.features_touching(key) {
            edit.feature_edits
                .entry(feature.to_string())
                .or_default()
                .insert(value.to_string());
        }
    }

    if new_dir != record.dir {
        let fields = [("readme", &record.readme), ("license-file", &record.license_file)];
        for (field, value) in fields {
            let Some(old) = value else { continue };
            let Some(file) = paths::normalize(&record.dir.join(old)) else {
                continue;
            };
            let file = relocate_path(graph, locations, &file).unwrap_or(file);
            let new = paths::to_manifest_string(&paths::relative(new_dir, &file));
            if new != *old {
                edit.package_updates.push(PackageFieldUpdate {
                    field,
                    old: old.clone(),
                    new,
                });
            }
        }
    }

    Some(edit)
}

fn mismatch(manifest: &Path, reason: impl Into<String>) -> CarveError {
    CarveError::MalformedManifest {
        path: manifest.to_path_buf(),
        reason: reason.into(),
    }
}

fn table_at<'d>(doc: &'d mut DocumentMut, segments: &[&str]) -> Option<&'d mut dyn TableLike> {
    let mut table: &'d mut dyn TableLike = doc.as_table_mut();
    for seg in segments {
        table = table.get_mut(seg)?.as_table_like_mut()?;
    }
    Some(table)
}

fn string_values(item: Option<&Item>) -> Option<Vec<String>> {
    item?.as_array().map(|a| {
        a.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// Set `key` to a one-entry-per-line string array, unless it already holds
/// exactly `values`. An empty list removes the key.
fn set_string_array(table: &mut dyn TableLike, key: &str, values: &[String]) {
    if values.is_empty() {
        table.remove(key);
        return;
    }
    if string_values(table.get(key)).as_deref() == Some(values) {
        return;
    }
    let mut array = Array::new();
    for v in values {
        let mut value = Value::from(v.as_str());
        value.decor_mut().set_prefix("\n    ");
        array.push_formatted(value);
    }
    array.set_trailing_comma(true);
    array.set_trailing("\n");
    table.insert(key, Item::Value(Value::Array(array)));
}

fn replace_string(item: &mut Item, new: &str) {
    if let Some(value) = item.as_value_mut() {
        let decor = value.decor().clone();
        *value = Value::from(new);
        *value.decor_mut() = decor;
    }
}

fn apply_path_update(doc: &mut DocumentMut, update: &PathUpdate, manifest: &Path) -> Result<()> {
    let table = table_at(doc, &update.table.segments())
        .ok_or_else(|| mismatch(manifest, format!("no {} table", update.table)))?;
    let item = table
        .get_mut(&update.key)
        .and_then(Item::as_table_like_mut)
        .and_then(|entry| entry.get_mut("path"))
        .ok_or_else(|| mismatch(manifest, format!("`{}` in {} has no path", update.key, update.table)))?;
    match item.as_str() {
        Some(current) if current == update.old => {}
        current => {
            return Err(mismatch(
                manifest,
                format!(
                    "expected path `{}` for `{}` in {}, found {:?}",
                    update.old, update.key, update.table, current
                ),
            ));
        }
    }
    replace_string(item, &update.new);
    Ok(())
}

fn apply_removal(doc: &mut DocumentMut, removal: &Removal, manifest: &Path) -> Result<()> {
    table_at(doc, &removal.table.segments())
        .and_then(|t| t.remove(&removal.key))
        .map(|_| ())
        .ok_or_else(|| mismatch(manifest, format!("`{}` is not in {}", removal.key, removal.table)))
}

fn apply_workspace_edit(doc: &mut DocumentMut, edit: &WorkspaceEdit, manifest: &Path) -> Result<()> {
    let ws = table_at(doc, &["workspace"]).ok_or_else(|| mismatch(manifest, "no [workspace] table"))?;
    set_string_array(ws, "members", &edit.members);
    if let Some(default_members) = &edit.default_members {
        set_string_array(ws, "default-members", default_members);
    }
    if let Some(exclude) = &edit.exclude {
        set_string_array(ws, "exclude", exclude);
    }
    for update in &edit.path_updates {
        apply_path_update(doc, update, manifest)?;
    }
    for removal in &edit.removals {
        apply_removal(doc, removal, manifest)?;
    }
    for over in &edit.profile_removals {
        apply_profile_removal(doc, over, manifest)?;
    }
    Ok(())
}

fn apply_profile_removal(doc: &mut DocumentMut, over: &ProfileOverride, manifest: &Path) -> Result<()> {
    let missing = || {
        mismatch(
            manifest,
            format!("no [profile.{}.package.{}] override", over.profile, over.package),
        )
    };
    let packages = table_at(doc, &["profile", over.profile.as_str(), "package"]).ok_or_else(missing)?;
    packages.remove(&over.package).ok_or_else(missing)?;
    if packages.is_empty()
        && let Some(profile) = table_at(doc, &["profile", over.profile.as_str()])
    {
        profile.remove("package");
    }
    Ok(())
}

fn apply_manifest_edit(doc: &mut DocumentMut, edit: &ManifestEdit) -> Result<()> {
    let manifest = edit.manifest.as_path();
    for update in &edit.path_updates {
        apply_path_update(doc, update, manifest)?;
    }
    for removal in &edit.removals {
        apply_removal(doc, removal, manifest)?;
    }
    if !edit.feature_edits.is_empty() {
        let features = table_at(doc, &["features"]).ok_or_else(|| mismatch(manifest, "no [features] table"))?;
        for (feature, drop) in &edit.feature_edits {
            let values = features
                .get_mut(feature)
                .and_then(Item::as_array_mut)
                .ok_or_else(|| mismatch(manifest, format!("feature `{feature}` is not an array")))?;
            values.retain(|v| !v.as_str().is_some_and(|s| drop.contains(s)));
        }
    }
    if !edit.package_updates.is_empty() {
        let package = table_at(doc, &["package"]).ok_or_else(|| mismatch(manifest, "no [package] table"))?;
        for update in &edit.package_updates {
            let item = package
                .get_mut(update.field)
                .filter(|i| i.as_str() == Some(update.old.as_str()))
                .ok_or_else(|| {
                    mismatch(manifest, format!("expected {} = `{}`", update.field, update.old))
                })?;
            replace_string(item, &update.new);
        }
    }
    Ok(())
}

/// Parse, edit and re-render one manifest. `None` when nothing changed.
fn edit_document(
    root: &Path,
    manifest: &Path,
    edit: impl FnOnce(&mut DocumentMut) -> Result<()>,
) -> Result<Option<String>> {
    let full = root.join(manifest);
    let original = std::fs::read_to_string(&full).map_err(|e| CarveError::io(&full, e))?;
    let mut doc: DocumentMut = original
        .parse()
        .map_err(|e: toml_edit::TomlError| mismatch(manifest, e.message().to_string()))?;
    edit(&mut doc)?;
    let updated = doc.to_string();
    Ok((updated != original).then_some(updated))
}

/// Apply `plan` to the manifests under `root`.
///
/// Every document is edited in memory first; if any edit does not match its
/// file, nothing is written. Writes go through a temp file and a rename.
pub fn apply_rewrite(root: &Path, plan: &RewritePlan) -> Result<RewriteReport> {
    let root_manifest = PathBuf::from(MANIFEST_FILE);
    let mut pending: Vec<(PathBuf, String)> = Vec::new();
    let mut report = RewriteReport::default();

    // A root package shares its file with the workspace section.
    let root_crate = plan.crates.values().find(|e| e.manifest == root_manifest);
    let updated = edit_document(root, &root_manifest, |doc| {
        apply_workspace_edit(doc, &plan.workspace, &root_manifest)?;
        match root_crate {
            Some(edit) => apply_manifest_edit(doc, edit),
            None => Ok(()),
        }
    })?;
    match updated {
        Some(text) => pending.push((root_manifest.clone(), text)),
        None => report.unchanged += 1,
    }

    for edit in plan.crates.values().filter(|e| e.manifest != root_manifest) {
        match edit_document(root, &edit.manifest, |doc| apply_manifest_edit(doc, edit))? {
            Some(text) => pending.push((edit.manifest.clone(), text)),
            None => report.unchanged += 1,
        }
    }

    for (manifest, text) in pending {
        crate::write_atomic(&root.join(&manifest), &text)?;
        tracing::debug!("rewrote {}", manifest.display());
        report.written.push(manifest);
    }
    Ok(report)
}

/// Re-read the rewritten tree and check that every reference resolves.
pub fn verify(root: &Path, locations: &CrateLocations) -> Result<()> {
    let workspace = read_workspace(root)?;
    let root_manifest = PathBuf::from(MANIFEST_FILE);
    let check = |manifest: &Path, dependency: &str, path: &Path| -> Result<()> {
        if root.join(path).join(MANIFEST_FILE).is_file() {
            Ok(())
        } else {
            Err(CarveError::DanglingDependencyReference {
                manifest: manifest.to_path_buf(),
                dependency: dependency.to_string(),
                path: path.to_path_buf(),
            })
        }
    };

    for (name, dir) in locations.iter() {
        if !workspace.members.iter().any(|m| m == dir) {
            return Err(CarveError::DanglingDependencyReference {
                manifest: root_manifest,
                dependency: name.to_string(),
                path: dir.to_path_buf(),
            });
        }
    }
    for member in &workspace.members {
        check(&root_manifest, &paths::to_manifest_string(member), member)?;
    }
    for dep in workspace.path_dependencies.values() {
        check(&root_manifest, &dep.key, &dep.path)?;
    }
    for patch in &workspace.patches {
        check(&root_manifest, &format!("{}.{}", patch.registry, patch.key), &patch.path)?;
    }
    for member in &workspace.members {
        let record = read_crate(root, member, &workspace)?;
        for dep in &record.local_deps {
            check(&record.manifest_path(), &dep.key, &dep.path)?;
        }
    }
    Ok(())
}
