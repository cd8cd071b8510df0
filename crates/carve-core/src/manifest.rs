//! Manifest Reader: parse the workspace manifest and each crate manifest into
//! structured records.
//!
//! Only path dependencies take part in graph traversal. Registry, git and
//! other dependency forms are recorded opaquely and pass through rewriting
//! unchanged.

use crate::error::{CarveError, Result};
use crate::paths;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use toml::{Table, Value};

pub const MANIFEST_FILE: &str = "Cargo.toml";

/// Dependency section a crate entry is declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    Normal,
    Build,
    Dev,
}

impl DepKind {
    pub const ALL: [DepKind; 3] = [DepKind::Normal, DepKind::Build, DepKind::Dev];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Normal => "dependencies",
            Self::Build => "build-dependencies",
            Self::Dev => "dev-dependencies",
        }
    }
}

/// Location of a dependency table inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DepTable {
    /// `[workspace.dependencies]` in the root manifest.
    Workspace,
    /// `[dependencies]` and friends, optionally under `[target.<cfg>]`.
    Crate {
        kind: DepKind,
        target: Option<String>,
    },
}

impl DepTable {
    pub fn plain(kind: DepKind) -> Self {
        Self::Crate { kind, target: None }
    }

    /// Key path from the document root to the table.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Workspace => vec!["workspace", "dependencies"],
            Self::Crate { kind, target: None } => vec![kind.table_name()],
            Self::Crate {
                kind,
                target: Some(cfg),
            } => vec!["target", cfg.as_str(), kind.table_name()],
        }
    }

    pub fn kind(&self) -> Option<DepKind> {
        match self {
            Self::Workspace => None,
            Self::Crate { kind, .. } => Some(*kind),
        }
    }
}

impl std::fmt::Display for DepTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.segments().join("."))
    }
}

/// A dependency resolved by relative filesystem path within the source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalDependency {
    /// Key in the dependency table.
    pub key: String,
    /// Package name the key refers to (`package = ".."` or the key itself).
    pub package: String,
    /// Path string as written in the manifest that declares it.
    pub declared_path: String,
    /// Target directory, relative to the repository root.
    pub path: PathBuf,
    pub table: DepTable,
    /// Declared as `key.workspace = true` and resolved through the root manifest.
    pub via_workspace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencySource {
    Registry,
    Git,
    Workspace,
    Other,
}

/// Any non-path dependency. Carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalDependency {
    pub key: String,
    pub table: DepTable,
    pub source: DependencySource,
}

/// One crate's manifest, parsed.
#[derive(Debug, Clone, Serialize)]
pub struct CrateRecord {
    pub name: String,
    /// Crate directory relative to the repository root.
    pub dir: PathBuf,
    pub local_deps: Vec<LocalDependency>,
    pub external_deps: Vec<ExternalDependency>,
    pub features: BTreeMap<String, Vec<String>>,
    /// `[package].readme` when given as a path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    /// `[package].license-file` when given as a path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_file: Option<String>,
}

impl CrateRecord {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Local dependencies declared under `key`, in any table.
    pub fn local_deps_named<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a LocalDependency> {
        self.local_deps.iter().filter(move |d| d.key == key)
    }

    /// Every (feature, value) pair whose value refers to dependency `key`.
    pub fn features_touching(&self, key: &str) -> Vec<(&str, &str)> {
        self.features
            .iter()
            .flat_map(|(feature, values)| {
                values
                    .iter()
                    .filter(|v| feature_value_references(v, key))
                    .map(move |v| (feature.as_str(), v.as_str()))
            })
            .collect()
    }
}

/// True if a `[features]` value enables or forwards to dependency `key`:
/// `key`, `dep:key`, `key/feat` or `key?/feat`.
pub fn feature_value_references(value: &str, key: &str) -> bool {
    if let Some(dep) = value.strip_prefix("dep:") {
        return dep == key;
    }
    match value.split_once('/') {
        Some((dep, _)) => dep.strip_suffix('?').unwrap_or(dep) == key,
        None => value == key,
    }
}

/// A `[workspace.dependencies]` entry that points at a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspacePathDependency {
    pub key: String,
    pub package: String,
    pub declared_path: String,
    pub path: PathBuf,
}

/// A `[patch.<registry>]` or `[replace]` entry with a `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchEntry {
    /// Registry or source the patch applies to, `replace` for `[replace]`.
    pub registry: String,
    pub key: String,
    pub declared_path: String,
    pub path: PathBuf,
}

/// A `[profile.<profile>.package.<package>]` override in the root manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileOverride {
    pub profile: String,
    pub package: String,
}

/// The root manifest's `[workspace]` section plus root-level patches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceManifest {
    /// Member directories after glob expansion, normalized and sorted.
    pub members: Vec<PathBuf>,
    /// Member entries exactly as written.
    pub member_patterns: Vec<String>,
    pub exclude: Vec<String>,
    pub default_members: Vec<String>,
    pub path_dependencies: BTreeMap<String, WorkspacePathDependency>,
    /// Keys of `[workspace.dependencies]` that are not path dependencies.
    pub inherited: BTreeSet<String>,
    pub patches: Vec<PatchEntry>,
    pub profile_overrides: Vec<ProfileOverride>,
}

fn malformed(path: &Path, reason: impl Into<String>) -> CarveError {
    CarveError::MalformedManifest {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn parse_table(content: &str, manifest: &Path) -> Result<Table> {
    toml::from_str::<Table>(content).map_err(|e| malformed(manifest, e.message().to_string()))
}

fn read_manifest_text(repo_root: &Path, manifest: &Path) -> Result<String> {
    std::fs::read_to_string(repo_root.join(manifest))
        .map_err(|e| malformed(manifest, format!("unreadable: {e}")))
}

fn string_array(value: Option<&Value>, manifest: &Path, field: &str) -> Result<Vec<String>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let array = value
        .as_array()
        .ok_or_else(|| malformed(manifest, format!("`{field}` must be an array")))?;
    array
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed(manifest, format!("`{field}` must contain strings")))
        })
        .collect()
}

/// Resolve `declared` relative to `base_dir` and check it stays inside the root.
fn resolve_path(base_dir: &Path, declared: &str, manifest: &Path, key: &str) -> Result<PathBuf> {
    paths::normalize(&base_dir.join(declared)).ok_or_else(|| {
        malformed(
            manifest,
            format!("path `{declared}` of `{key}` escapes the repository root"),
        )
    })
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand a member glob such as `crates/*` into directories holding a manifest.
fn expand_member_glob(repo_root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let root_manifest = Path::new(MANIFEST_FILE);
    let glob = globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| malformed(root_manifest, format!("bad member glob `{pattern}`: {e}")))?
        .compile_matcher();

    // Walk from the longest literal prefix, only as deep as the pattern reaches.
    let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let literal = components
        .iter()
        .take_while(|c| !has_glob_chars(c))
        .copied()
        .collect::<Vec<_>>();
    let depth = components.len() - literal.len();
    let prefix: PathBuf = literal.iter().collect();

    let start = repo_root.join(&prefix);
    if !start.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    let walker = ignore::WalkBuilder::new(&start)
        .standard_filters(false)
        .max_depth(Some(depth))
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(repo_root) else {
            continue;
        };
        if glob.is_match(rel) {
            found.push(rel.to_path_buf());
        }
    }
    Ok(found)
}

/// Read the root manifest's `[workspace]` section.
pub fn read_workspace(repo_root: &Path) -> Result<WorkspaceManifest> {
    let manifest = Path::new(MANIFEST_FILE);
    let content = read_manifest_text(repo_root, manifest)?;
    let mut workspace = parse_workspace(&content)?;

    let excluded: Vec<PathBuf> = workspace
        .exclude
        .iter()
        .filter_map(|e| paths::normalize(Path::new(e)))
        .collect();

    let mut members = BTreeSet::new();
    for pattern in &workspace.member_patterns {
        if has_glob_chars(pattern) {
            members.extend(expand_member_glob(repo_root, pattern)?);
        } else {
            let dir = paths::normalize(Path::new(pattern)).ok_or_else(|| {
                malformed(manifest, format!("member `{pattern}` escapes the repository root"))
            })?;
            members.insert(dir);
        }
    }
    workspace.members = members
        .into_iter()
        .filter(|m| !excluded.iter().any(|e| paths::is_within(m, e)))
        .collect();
    Ok(workspace)
}

/// Parse root manifest text. Member globs are left unexpanded.
pub fn parse_workspace(content: &str) -> Result<WorkspaceManifest> {
    let manifest = Path::new(MANIFEST_FILE);
    let table = parse_table(content, manifest)?;
    let ws = table
        .get("workspace")
        .and_then(Value::as_table)
        .ok_or_else(|| malformed(manifest, "no [workspace] table"))?;

    let member_patterns = string_array(ws.get("members"), manifest, "workspace.members")?;
    let exclude = string_array(ws.get("exclude"), manifest, "workspace.exclude")?;
    let default_members =
        string_array(ws.get("default-members"), manifest, "workspace.default-members")?;

    let mut path_dependencies = BTreeMap::new();
    let mut inherited = BTreeSet::new();
    if let Some(deps) = ws.get("dependencies") {
        let deps = deps
            .as_table()
            .ok_or_else(|| malformed(manifest, "[workspace.dependencies] must be a table"))?;
        for (key, value) in deps {
            let declared = value
                .as_table()
                .and_then(|t| t.get("path"))
                .map(|p| {
                    p.as_str()
                        .ok_or_else(|| malformed(manifest, format!("path of `{key}` must be a string")))
                })
                .transpose()?;
            match declared {
                Some(declared) => {
                    let path = resolve_path(Path::new(""), declared, manifest, key)?;
                    let package = value
                        .get("package")
                        .and_then(Value::as_str)
                        .unwrap_or(key)
                        .to_string();
                    path_dependencies.insert(
                        key.clone(),
                        WorkspacePathDependency {
                            key: key.clone(),
                            package,
                            declared_path: declared.to_string(),
                            path,
                        },
                    );
                }
                None => {
                    inherited.insert(key.clone());
                }
            }
        }
    }

    let mut patches = Vec::new();
    if let Some(patch) = table.get("patch").and_then(Value::as_table) {
        for (registry, entries) in patch {
            if let Some(entries) = entries.as_table() {
                collect_patches(registry, entries, manifest, &mut patches)?;
            }
        }
    }
    if let Some(replace) = table.get("replace").and_then(Value::as_table) {
        collect_patches("replace", replace, manifest, &mut patches)?;
    }

    let mut profile_overrides = Vec::new();
    if let Some(profiles) = table.get("profile").and_then(Value::as_table) {
        for (profile, body) in profiles {
            let Some(packages) = body.get("package").and_then(Value::as_table) else {
                continue;
            };
            profile_overrides.extend(packages.keys().map(|package| ProfileOverride {
                profile: profile.clone(),
                package: package.clone(),
            }));
        }
    }

    Ok(WorkspaceManifest {
        members: Vec::new(),
        member_patterns,
        exclude,
        default_members,
        path_dependencies,
        inherited,
        patches,
        profile_overrides,
    })
}

fn collect_patches(
    registry: &str,
    entries: &Table,
    manifest: &Path,
    out: &mut Vec<PatchEntry>,
) -> Result<()> {
    for (key, value) in entries {
        if let Some(declared) = value.get("path").and_then(Value::as_str) {
            let path = resolve_path(Path::new(""), declared, manifest, key)?;
            out.push(PatchEntry {
                registry: registry.to_string(),
                key: key.clone(),
                declared_path: declared.to_string(),
                path,
            });
        }
    }
    Ok(())
}

/// Read one crate manifest from `repo_root/crate_dir/Cargo.toml`.
pub fn read_crate(
    repo_root: &Path,
    crate_dir: &Path,
    workspace: &WorkspaceManifest,
) -> Result<CrateRecord> {
    let manifest = crate_dir.join(MANIFEST_FILE);
    let content = read_manifest_text(repo_root, &manifest)?;
    parse_crate(&content, crate_dir, workspace)
}

/// Parse crate manifest text for the crate living at `crate_dir`.
pub fn parse_crate(
    content: &str,
    crate_dir: &Path,
    workspace: &WorkspaceManifest,
) -> Result<CrateRecord> {
    let manifest = crate_dir.join(MANIFEST_FILE);
    let table = parse_table(content, &manifest)?;

    let package = table.get("package").and_then(Value::as_table);
    let name = package
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| CarveError::MissingIdentity {
            path: manifest.clone(),
        })?
        .to_string();
    let readme = package
        .and_then(|p| p.get("readme"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let license_file = package
        .and_then(|p| p.get("license-file"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut local_deps = Vec::new();
    let mut external_deps = Vec::new();
    for (dep_table, entries) in dependency_tables(&table, &manifest)? {
        for (key, value) in entries {
            classify_dependency(
                key,
                value,
                &dep_table,
                crate_dir,
                &manifest,
                workspace,
                &mut local_deps,
                &mut external_deps,
            )?;
        }
    }

    let mut features = BTreeMap::new();
    if let Some(f) = table.get("features") {
        let f = f
            .as_table()
            .ok_or_else(|| malformed(&manifest, "[features] must be a table"))?;
        for (feature, values) in f {
            features.insert(
                feature.clone(),
                string_array(Some(values), &manifest, &format!("features.{feature}"))?,
            );
        }
    }

    Ok(CrateRecord {
        name,
        dir: crate_dir.to_path_buf(),
        local_deps,
        external_deps,
        features,
        readme,
        license_file,
    })
}

fn dependency_tables<'a>(table: &'a Table, manifest: &Path) -> Result<Vec<(DepTable, &'a Table)>> {
    let mut out = Vec::new();
    let mut push = |holder: &'a Table, target: Option<&String>| -> Result<()> {
        for kind in DepKind::ALL {
            match holder.get(kind.table_name()) {
                Some(Value::Table(t)) => out.push((
                    DepTable::Crate {
                        kind,
                        target: target.cloned(),
                    },
                    t,
                )),
                Some(_) => {
                    return Err(malformed(
                        manifest,
                        format!("[{}] must be a table", kind.table_name()),
                    ));
                }
                None => {}
            }
        }
        Ok(())
    };

    push(table, None)?;
    if let Some(targets) = table.get("target").and_then(Value::as_table) {
        for (cfg, body) in targets {
            if let Some(body) = body.as_table() {
                push(body, Some(cfg))?;
            }
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn classify_dependency(
    key: &str,
    value: &Value,
    table: &DepTable,
    crate_dir: &Path,
    manifest: &Path,
    workspace: &WorkspaceManifest,
    local: &mut Vec<LocalDependency>,
    external: &mut Vec<ExternalDependency>,
) -> Result<()> {
    let entry = match value {
        Value::String(_) => {
            external.push(ExternalDependency {
                key: key.to_string(),
                table: table.clone(),
                source: DependencySource::Registry,
            });
            return Ok(());
        }
        Value::Table(t) => t,
        _ => {
            return Err(malformed(
                manifest,
                format!("dependency `{key}` in {table} must be a string or table"),
            ));
        }
    };

    if entry.get("workspace").and_then(Value::as_bool) == Some(true) {
        if let Some(ws_dep) = workspace.path_dependencies.get(key) {
            local.push(LocalDependency {
                key: key.to_string(),
                package: ws_dep.package.clone(),
                declared_path: ws_dep.declared_path.clone(),
                path: ws_dep.path.clone(),
                table: table.clone(),
                via_workspace: true,
            });
        } else if workspace.inherited.contains(key) {
            external.push(ExternalDependency {
                key: key.to_string(),
                table: table.clone(),
                source: DependencySource::Workspace,
            });
        } else {
            return Err(malformed(
                manifest,
                format!("`{key}` inherits from the workspace but [workspace.dependencies] has no such entry"),
            ));
        }
        return Ok(());
    }

    if let Some(path) = entry.get("path") {
        let declared = path
            .as_str()
            .ok_or_else(|| malformed(manifest, format!("path of `{key}` must be a string")))?;
        let package = entry
            .get("package")
            .and_then(Value::as_str)
            .unwrap_or(key)
            .to_string();
        local.push(LocalDependency {
            key: key.to_string(),
            package,
            declared_path: declared.to_string(),
            path: resolve_path(crate_dir, declared, manifest, key)?,
            table: table.clone(),
            via_workspace: false,
        });
        return Ok(());
    }

    let source = if entry.contains_key("git") {
        DependencySource::Git
    } else if entry.contains_key("version") {
        DependencySource::Registry
    } else {
        DependencySource::Other
    };
    external.push(ExternalDependency {
        key: key.to_string(),
        table: table.clone(),
        source,
    });
    Ok(())
}

/// Read every workspace member, in parallel, then follow path dependencies
/// into directories that are not listed as members (Cargo treats those as
/// implicit members). Returns records sorted by crate name.
pub fn read_all(repo_root: &Path, workspace: &WorkspaceManifest) -> Result<Vec<CrateRecord>> {
    use rayon::prelude::*;

    let mut seen: BTreeSet<PathBuf> = workspace.members.iter().cloned().collect();
    let mut frontier: Vec<PathBuf> = workspace.members.clone();
    let mut records = Vec::new();

    while !frontier.is_empty() {
        // `collect` is the barrier: every manifest in this wave is parsed before
        // any record is inspected.
        let wave = frontier
            .par_iter()
            .map(|dir| read_crate(repo_root, dir, workspace))
            .collect::<Result<Vec<_>>>()?;

        frontier = Vec::new();
        for record in &wave {
            for dep in &record.local_deps {
                if !seen.contains(&dep.path)
                    && repo_root.join(&dep.path).join(MANIFEST_FILE).is_file()
                {
                    tracing::debug!(
                        "{} is not a workspace member, reading it as a path dependency of {}",
                        dep.path.display(),
                        record.name
                    );
                    seen.insert(dep.path.clone());
                    frontier.push(dep.path.clone());
                }
            }
        }
        records.extend(wave);
    }

    records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.dir.cmp(&b.dir)));
    Ok(records)
}
