//! Configuration for extraction and publishing.
//!
//! Load order: `carve.toml` → environment variables → defaults.
//! The configuration is read once at run start and never changes mid-run.

use anyhow::{Context, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "carve.toml";

/// Top-level carve configuration.
///
/// A `[[stub]]` list in the file replaces the default stubs entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarveConfig {
    pub extract: ExtractConfig,
    pub prune: PruneConfig,
    #[serde(rename = "stub")]
    pub stubs: Vec<StubTarget>,
    pub sync: SyncConfig,
}

/// Which crate to extract and how to lay out the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// The crate whose transitive local dependencies are kept.
    pub root_crate: String,
    /// Follow `[dev-dependencies]` when computing the closure (default on).
    /// When off, dev-dependencies on pruned crates are dropped from manifests.
    pub follow_dev_dependencies: bool,
    /// Crate name -> new directory (relative to the repository root).
    ///
    /// Example:
    /// [extract.relocate]
    /// gpui_macros = "crates/gpui/macros"
    pub relocate: BTreeMap<String, String>,
}

/// Top-level exclusion policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    /// Globs over top-level entry names that are deleted.
    pub exclude: Vec<String>,
    /// Globs over top-level entry names that are never deleted by `exclude`.
    pub essential: Vec<String>,
    /// Globs over file and directory names inside kept crates that are
    /// deleted. Empty by default.
    ///
    /// Example:
    /// crate_exclude = ["docs", "README*", "LICENSE*", "CHANGELOG*", "*.md", "*.txt"]
    pub crate_exclude: Vec<String>,
    /// Paths relative to the repository root, such as `crates/gpui/README.md`,
    /// that `crate_exclude` never deletes.
    pub crate_keep: Vec<String>,
    /// Delete symlinks inside kept crates.
    pub crate_symlinks: bool,
}

/// Kind of construct a stub replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StubKind {
    /// A `macro_rules!` definition: matchers kept, transcribers replaced.
    Macro,
    /// A `mod` item: body (inline or file) replaced with `replacement`.
    Module,
    /// An external crate brought in with `use name::..`: an inline
    /// `mod name { replacement }` is inserted ahead of the first such import.
    Import,
}

/// A heavy construct replaced by a minimal stand-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubTarget {
    pub name: String,
    pub kind: StubKind,
    /// Transcriber used for every macro rule. Defaults to `()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<String>,
    /// Source that replaces a module body. Required for modules and imports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Dependency keys removed from manifests of crates where this stub applied.
    /// Dropped edges are not followed when computing the KeepSet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_dependencies: Vec<String>,
    /// Only apply to this crate. A scoped stub whose crate is not kept is skipped.
    #[serde(rename = "crate", default, skip_serializing_if = "Option::is_none")]
    pub crate_name: Option<String>,
}

/// Upstream/distribution endpoints and transport limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub upstream_url: Option<String>,
    pub upstream_branch: String,
    pub distribution_url: Option<String>,
    pub distribution_branch: String,
    /// Env var holding an HTTPS token for both remotes.
    pub token_env: String,
    pub author_name: String,
    pub author_email: String,
    /// Per network operation.
    pub timeout_secs: u64,
    /// Attempts per network operation (>= 1).
    pub retries: u32,
    /// Backoff before attempt N+1; the last value repeats.
    pub retry_delays_ms: Vec<u64>,
    pub lock_path: PathBuf,
    /// A lock file older than this is considered abandoned.
    pub lock_stale_secs: u64,
    /// Interval for `carve sync --every` when not given on the command line.
    pub interval_secs: u64,
    /// Parent directory for per-run working copies (system temp dir if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

/// Stand-in for the `perf` crate that `util_macros` imports with `use perf::*;`.
const PERF_STUB: &str = r#"#[derive(Default, Clone, Copy, Debug)]
pub enum Importance {
    Critical,
    Important,
    #[default]
    Average,
    Iffy,
    Fluff,
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub mod consts {
    pub const SUF_NORMAL: &str = "";
    pub const SUF_MDATA: &str = "";
    pub const ITER_ENV_VAR: &str = "";
    pub const MDATA_LINE_PREF: &str = "";
    pub const MDATA_VER: u32 = 0;
    pub const WEIGHT_DEFAULT: u8 = 0;
    pub const ITER_COUNT_LINE_NAME: &str = "";
    pub const WEIGHT_LINE_NAME: &str = "";
    pub const IMPORTANCE_LINE_NAME: &str = "";
    pub const VERSION_LINE_NAME: &str = "";
}"#;

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            extract: ExtractConfig::default(),
            prune: PruneConfig::default(),
            stubs: vec![StubTarget {
                name: "perf".to_string(),
                kind: StubKind::Import,
                expansion: None,
                replacement: Some(PERF_STUB.to_string()),
                drop_dependencies: vec!["perf".to_string()],
                crate_name: Some("util_macros".to_string()),
            }],
            sync: SyncConfig::default(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            root_crate: "gpui".to_string(),
            follow_dev_dependencies: true,
            relocate: BTreeMap::new(),
        }
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        let exclude = [
            ".github",
            ".zed",
            ".cloudflare",
            ".config",
            "assets",
            "docs",
            "extensions",
            "legal",
            "nix",
            "script",
            "tooling",
            "*.md",
            "*.yml",
            "*.yaml",
            "*.nix",
            "flake.lock",
            "typos.toml",
            "Procfile*",
            "Dockerfile*",
        ];
        let essential = [
            "Cargo.toml",
            "Cargo.lock",
            "LICENSE*",
            "README.md",
            "rust-toolchain.toml",
            "clippy.toml",
            ".cargo",
            ".gitignore",
            "crates",
        ];
        Self {
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            essential: essential.iter().map(|s| s.to_string()).collect(),
            crate_exclude: Vec::new(),
            crate_keep: Vec::new(),
            crate_symlinks: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            upstream_branch: "main".to_string(),
            distribution_url: None,
            distribution_branch: "main".to_string(),
            token_env: "CARVE_GIT_TOKEN".to_string(),
            author_name: "carve-bot".to_string(),
            author_email: "carve-bot@users.noreply.github.com".to_string(),
            timeout_secs: 600,
            retries: 3,
            retry_delays_ms: vec![2000, 4000, 8000],
            lock_path: PathBuf::from(".carve.lock"),
            lock_stale_secs: 2 * 60 * 60,
            interval_secs: 24 * 60 * 60,
            workdir: None,
        }
    }
}

impl PruneConfig {
    pub fn exclude_set(&self) -> Result<GlobSet> {
        build_glob_set(&self.exclude).context("invalid [prune].exclude glob")
    }

    pub fn essential_set(&self) -> Result<GlobSet> {
        build_glob_set(&self.essential).context("invalid [prune].essential glob")
    }

    pub fn crate_exclude_set(&self) -> Result<GlobSet> {
        build_glob_set(&self.crate_exclude).context("invalid [prune].crate_exclude glob")
    }

    /// Whether any cleanup inside kept crates is configured.
    pub fn cleans_crates(&self) -> bool {
        !self.crate_exclude.is_empty() || self.crate_symlinks
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        let glob: Glob = GlobBuilder::new(p).literal_separator(true).build()?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

impl StubTarget {
    /// Transcriber text for macro stubs.
    pub fn expansion(&self) -> &str {
        self.expansion.as_deref().unwrap_or("()")
    }
}

/// Helper to parse an env var and apply it to a config field.
fn env_override<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(v) = std::env::var(var)
        && let Ok(n) = v.parse()
    {
        *target = n;
    }
}

fn env_override_opt(var: &str, target: &mut Option<String>) {
    if let Ok(v) = std::env::var(var)
        && !v.is_empty()
    {
        *target = Some(v);
    }
}

impl CarveConfig {
    /// Load config from the given file, with env var overrides.
    /// Falls back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            Self::default()
        };

        // Environment variable overrides
        env_override("CARVE_ROOT_CRATE", &mut config.extract.root_crate);
        env_override_opt("CARVE_UPSTREAM_URL", &mut config.sync.upstream_url);
        env_override_opt("CARVE_DISTRIBUTION_URL", &mut config.sync.distribution_url);
        env_override("CARVE_TIMEOUT_SECS", &mut config.sync.timeout_secs);
        env_override("CARVE_RETRIES", &mut config.sync.retries);

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.extract.root_crate.trim().is_empty() {
            anyhow::bail!("[extract].root_crate must not be empty");
        }
        self.prune.exclude_set()?;
        self.prune.essential_set()?;
        self.prune.crate_exclude_set()?;

        for stub in &self.stubs {
            if stub.name.is_empty()
                || !stub
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                anyhow::bail!("stub name `{}` is not a Rust identifier", stub.name);
            }
            match stub.kind {
                StubKind::Module | StubKind::Import if stub.replacement.is_none() => {
                    anyhow::bail!("{:?} stub `{}` needs a `replacement`", stub.kind, stub.name);
                }
                _ => {}
            }
            if stub.crate_name.as_deref().is_some_and(|c| c.trim().is_empty()) {
                anyhow::bail!("stub `{}` has an empty `crate` scope", stub.name);
            }
        }

        if self.sync.retries == 0 {
            anyhow::bail!("[sync].retries must be at least 1");
        }
        if self.sync.timeout_secs == 0 {
            anyhow::bail!("[sync].timeout_secs must be positive");
        }
        Ok(())
    }
}
