//! End-to-end transforms over small workspaces written to disk.

use carve_core::CarveError;
use carve_core::config::{CarveConfig, StubKind, StubTarget};
use carve_core::manifest::{DepKind, read_crate, read_workspace};
use carve_transform::{Extraction, dry_run, transform};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn read(root: &Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel)).unwrap()
}

const ROOT_MANIFEST: &str = r#"[workspace]
resolver = "2"
members = ["crates/*"]
default-members = ["crates/zed"]

[workspace.dependencies]
# local crates
gpui = { path = "crates/gpui" }
util = { path = "crates/util" }
zed = { path = "crates/zed" }
anyhow = "1.0"

[patch.crates-io]
notify = { git = "https://github.com/zed-industries/notify" }
"#;

const GPUI_MANIFEST: &str = r#"[package]
name = "gpui"
version = "0.1.0"
edition = "2021"
readme = "../../README.md"

[features]
test-support = ["util/test-support", "zed_test/fixtures"]
metrics = ["dep:analytics"]

[dependencies]
anyhow.workspace = true
util.workspace = true
collections = { path = "../collections" } # small helpers
analytics = { version = "0.3", optional = true }

[dev-dependencies]
zed_test = { path = "../zed_test" }
"#;

const GPUI_LIB: &str = r#"#[macro_export]
macro_rules! telemetry_event {
    ($name:expr) => {
        $crate::telemetry::send($name)
    };
}

pub mod telemetry;

pub fn open() {
    telemetry_event!("open");
}
"#;

/// gpui → {util, collections}; zed → {gpui, zed_test}; gpui dev → zed_test.
fn zed_like_workspace() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "Cargo.toml", ROOT_MANIFEST);
    write(root, "README.md", "# zed\n");
    write(root, "CONTRIBUTING.md", "be nice\n");
    write(root, "docs/guide.md", "guide\n");
    write(root, "script/bootstrap", "#!/bin/sh\n");
    write(root, ".github/workflows/ci.yml", "on: push\n");

    write(root, "crates/gpui/Cargo.toml", GPUI_MANIFEST);
    write(root, "crates/gpui/src/lib.rs", GPUI_LIB);
    write(
        root,
        "crates/gpui/src/telemetry.rs",
        "pub fn send(name: &str) {\n    analytics::post(name);\n}\n",
    );
    write(
        root,
        "crates/util/Cargo.toml",
        "[package]\nname = \"util\"\nversion = \"0.1.0\"\n\n[features]\ntest-support = []\n",
    );
    write(root, "crates/util/src/lib.rs", "pub fn noop() {}\n");
    write(
        root,
        "crates/collections/Cargo.toml",
        "[package]\nname = \"collections\"\nversion = \"0.1.0\"\n",
    );
    write(root, "crates/collections/src/lib.rs", "");
    write(
        root,
        "crates/zed/Cargo.toml",
        "[package]\nname = \"zed\"\nversion = \"0.1.0\"\n\n[dependencies]\ngpui.workspace = true\nzed_test = { path = \"../zed_test\" }\n",
    );
    write(root, "crates/zed/src/main.rs", "fn main() {}\n");
    write(
        root,
        "crates/zed_test/Cargo.toml",
        "[package]\nname = \"zed_test\"\nversion = \"0.1.0\"\n",
    );
    tmp
}

fn stub(name: &str, kind: StubKind) -> StubTarget {
    StubTarget {
        name: name.to_string(),
        kind,
        expansion: None,
        replacement: None,
        drop_dependencies: Vec::new(),
        crate_name: None,
    }
}

/// Dev-dependencies are not followed, so `zed_test` is pruned from gpui.
fn without_dev_config() -> CarveConfig {
    let mut config = CarveConfig::default();
    config.extract.follow_dev_dependencies = false;
    config
}

#[test]
fn test_transform_reduces_tree_to_closure() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let report = transform(root, &without_dev_config()).unwrap();

    assert_eq!(report.keep.iter().collect::<Vec<_>>(), vec!["collections", "gpui", "util"]);
    assert_eq!(report.pruned_crates, vec!["zed", "zed_test"]);
    for gone in ["crates/zed", "crates/zed_test", "docs", "script", ".github", "CONTRIBUTING.md"] {
        assert!(!root.join(gone).exists(), "{gone} should be pruned");
    }
    for kept in ["README.md", "crates/gpui/src/lib.rs", "crates/util", "crates/collections"] {
        assert!(root.join(kept).exists(), "{kept} should survive");
    }

    let ws = read_workspace(root).unwrap();
    assert_eq!(
        ws.members,
        vec![
            PathBuf::from("crates/collections"),
            PathBuf::from("crates/gpui"),
            PathBuf::from("crates/util"),
        ]
    );
    assert!(ws.default_members.is_empty());
    assert_eq!(ws.path_dependencies.keys().collect::<Vec<_>>(), vec!["gpui", "util"]);
    assert!(ws.inherited.contains("anyhow"));

    let gpui = read_crate(root, Path::new("crates/gpui"), &ws).unwrap();
    assert!(gpui.local_deps_named("zed_test").next().is_none());
    assert_eq!(gpui.features["test-support"], vec!["util/test-support"]);
    // Untouched entries keep their formatting.
    let text = read(root, "crates/gpui/Cargo.toml");
    assert!(text.contains("collections = { path = \"../collections\" } # small helpers"));
    assert!(read(root, "Cargo.toml").contains("# local crates"));
}

#[test]
fn test_second_transform_is_a_no_op() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let config = CarveConfig::default();
    transform(root, &config).unwrap();
    let snapshot = read(root, "Cargo.toml");

    let again = transform(root, &config).unwrap();
    assert!(again.prune.is_empty(), "{:?}", again.prune);
    assert!(again.manifests_written.is_empty());
    assert!(again.stubbed_files.is_empty());
    assert_eq!(read(root, "Cargo.toml"), snapshot);
}

#[test]
fn test_deletions_stay_under_root() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let config = CarveConfig::default();
    let extraction = Extraction::analyze(root, &config).unwrap();
    let plan = extraction.plan_prune(root, &config).unwrap();
    assert!(!plan.deletions.is_empty());
    for target in &plan.deletions {
        assert!(target.is_relative());
        assert!(carve_core::paths::normalize(target).as_deref() == Some(target.as_path()));
        assert!(!extraction.keep.kept(&extraction.graph).iter().any(|r| r.dir.starts_with(target)));
    }
    plan.validate(root).unwrap();
}

#[test]
fn test_dry_run_leaves_tree_untouched() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let report = dry_run(root, &without_dev_config()).unwrap();
    assert!(report.dry_run);
    assert!(report.prune.deletions.contains(&PathBuf::from("crates/zed")));
    assert!(root.join("crates/zed/Cargo.toml").exists());
    assert_eq!(read(root, "Cargo.toml"), ROOT_MANIFEST);
    assert!(report.rewrite.crates.contains_key("gpui"));
}

#[test]
fn test_patch_to_pruned_crate_is_dangling() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let manifest = ROOT_MANIFEST.replace(
        "[patch.crates-io]\n",
        "[patch.crates-io]\nzed-test = { path = \"crates/zed_test\" }\n",
    );
    write(root, "Cargo.toml", &manifest);

    let err = transform(root, &without_dev_config()).unwrap_err();
    match err {
        CarveError::DanglingDependencyReference { dependency, path, .. } => {
            assert_eq!(dependency, "crates-io.zed-test");
            assert_eq!(path, PathBuf::from("crates/zed_test"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_stubs_apply_and_drop_dependencies() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let mut config = CarveConfig::default();
    config.stubs = vec![
        stub("telemetry_event", StubKind::Macro),
        StubTarget {
            replacement: Some("pub fn send(_: &str) {}".to_string()),
            drop_dependencies: vec!["analytics".to_string()],
            ..stub("telemetry", StubKind::Module)
        },
    ];

    let report = transform(root, &config).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(
        report.stubbed_files,
        vec![
            PathBuf::from("crates/gpui/src/lib.rs"),
            PathBuf::from("crates/gpui/src/telemetry.rs"),
        ]
    );

    let lib = read(root, "crates/gpui/src/lib.rs");
    assert!(lib.contains("    ($name:expr) => { () };\n"));
    assert!(lib.contains("telemetry_event!(\"open\");"));
    assert_eq!(read(root, "crates/gpui/src/telemetry.rs"), "pub fn send(_: &str) {}\n");

    let ws = read_workspace(root).unwrap();
    let gpui = read_crate(root, Path::new("crates/gpui"), &ws).unwrap();
    assert!(!gpui.external_deps.iter().any(|d| d.key == "analytics"));
    assert!(gpui.features["metrics"].is_empty());

    let again = transform(root, &config).unwrap();
    assert!(again.stubbed_files.is_empty());
    assert!(again.manifests_written.is_empty());
}

#[test]
fn test_missing_stub_target_warns_once_and_succeeds() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let mut config = CarveConfig::default();
    config.stubs = vec![stub("ghost_macro", StubKind::Macro)];

    let report = transform(root, &config).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("ghost_macro"));
}

#[test]
fn test_stub_outside_kept_crates_is_not_found() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    write(
        root,
        "crates/zed/src/lib.rs",
        "macro_rules! only_in_zed { () => { 1 }; }\n",
    );
    let mut config = CarveConfig::default();
    config.stubs = vec![stub("only_in_zed", StubKind::Macro)];

    let report = transform(root, &config).unwrap();
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn test_relocation_recomputes_paths() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let mut config = CarveConfig::default();
    config
        .extract
        .relocate
        .insert("gpui".to_string(), "gpui".to_string());

    let report = transform(root, &config).unwrap();
    let gpui_edit = &report.rewrite.crates["gpui"];
    assert_eq!(
        gpui_edit.path_changes().into_iter().collect::<Vec<_>>(),
        vec![
            ("../collections", "../crates/collections"),
            ("../zed_test", "../crates/zed_test"),
        ]
    );
    assert!(root.join("gpui/src/lib.rs").exists());
    assert!(!root.join("crates/gpui").exists());

    let ws = read_workspace(root).unwrap();
    assert_eq!(
        ws.members,
        vec![
            PathBuf::from("crates/collections"),
            PathBuf::from("crates/util"),
            PathBuf::from("crates/zed_test"),
            PathBuf::from("gpui"),
        ]
    );
    assert_eq!(ws.path_dependencies["gpui"].path, PathBuf::from("gpui"));

    let gpui = read_crate(root, Path::new("gpui"), &ws).unwrap();
    assert_eq!(gpui.readme.as_deref(), Some("../README.md"));
    let collections = gpui.local_deps_named("collections").next().unwrap();
    assert_eq!(collections.path, PathBuf::from("crates/collections"));
    assert_eq!(collections.table.kind(), Some(DepKind::Normal));
}

#[test]
fn test_dev_dependencies_are_kept_by_default() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let report = transform(root, &CarveConfig::default()).unwrap();

    assert_eq!(
        report.keep.iter().collect::<Vec<_>>(),
        vec!["collections", "gpui", "util", "zed_test"]
    );
    assert_eq!(report.pruned_crates, vec!["zed"]);
    assert!(root.join("crates/zed_test/Cargo.toml").exists());

    let ws = read_workspace(root).unwrap();
    assert!(ws.members.contains(&PathBuf::from("crates/zed_test")));
    let gpui = read_crate(root, Path::new("crates/gpui"), &ws).unwrap();
    let zed_test = gpui.local_deps_named("zed_test").next().unwrap();
    assert_eq!(zed_test.table.kind(), Some(DepKind::Dev));
    assert_eq!(
        gpui.features["test-support"],
        vec!["util/test-support", "zed_test/fixtures"]
    );
}

/// util → util_macros → perf, where util_macros pulls perf in with `use perf::*;`.
fn with_perf_tooling(root: &Path) {
    let manifest = ROOT_MANIFEST
        .replace(
            "members = [\"crates/*\"]",
            "members = [\"crates/*\", \"tooling/perf\"]",
        )
        .replace("anyhow = \"1.0\"", "perf = { path = \"tooling/perf\" }\nanyhow = \"1.0\"");
    write(root, "Cargo.toml", &manifest);
    write(
        root,
        "crates/util/Cargo.toml",
        "[package]\nname = \"util\"\nversion = \"0.1.0\"\n\n[features]\ntest-support = []\n\n[dependencies]\nutil_macros = { path = \"../util_macros\" }\n",
    );
    write(
        root,
        "crates/util_macros/Cargo.toml",
        "[package]\nname = \"util_macros\"\nversion = \"0.1.0\"\n\n[lib]\npath = \"src/util_macros.rs\"\nproc-macro = true\n\n[dependencies]\nperf.workspace = true\nquote = \"1.0\"\n",
    );
    write(
        root,
        "crates/util_macros/src/util_macros.rs",
        "use proc_macro::TokenStream;\nuse perf::*;\n\nfn weight() -> u8 {\n    consts::WEIGHT_DEFAULT\n}\n",
    );
    write(
        root,
        "tooling/perf/Cargo.toml",
        "[package]\nname = \"perf\"\nversion = \"0.1.0\"\n\n[dependencies]\ncollections = { path = \"../../crates/collections\" }\n",
    );
    write(root, "tooling/perf/src/lib.rs", "pub mod consts {}\n");
}

#[test]
fn test_default_perf_stub_cuts_tooling_from_closure() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    with_perf_tooling(root);
    let config = CarveConfig::default();

    let report = transform(root, &config).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(report.pruned_crates.contains(&"perf".to_string()));
    assert!(report.keep.contains("util_macros"));
    assert!(!root.join("tooling").exists());
    assert_eq!(
        report.stubbed_files,
        vec![PathBuf::from("crates/util_macros/src/util_macros.rs")]
    );

    let source = read(root, "crates/util_macros/src/util_macros.rs");
    assert!(source.starts_with("use proc_macro::TokenStream;\nmod perf {\n    #[derive(Default, Clone, Copy, Debug)]\n"));
    assert!(source.contains("        pub const WEIGHT_DEFAULT: u8 = 0;\n"));
    assert!(source.contains("}\nuse perf::*;\n"));

    let ws = read_workspace(root).unwrap();
    assert!(!ws.members.iter().any(|m| m.starts_with("tooling")));
    assert!(!ws.path_dependencies.contains_key("perf"));
    let util_macros = read_crate(root, Path::new("crates/util_macros"), &ws).unwrap();
    assert!(util_macros.local_deps_named("perf").next().is_none());
    assert!(util_macros.external_deps.iter().any(|d| d.key == "quote"));

    let again = transform(root, &config).unwrap();
    assert!(again.stubbed_files.is_empty());
    assert!(again.manifests_written.is_empty());
}

#[test]
fn test_scoped_stub_ignores_other_crates() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    with_perf_tooling(root);
    write(root, "crates/collections/src/lib.rs", "use perf::consts;\n");

    let report = transform(root, &CarveConfig::default()).unwrap();
    assert_eq!(read(root, "crates/collections/src/lib.rs"), "use perf::consts;\n");
    assert!(!report.stubbed_files.contains(&PathBuf::from("crates/collections/src/lib.rs")));
}

#[test]
fn test_profile_overrides_for_pruned_crates_are_removed() {
    let tmp = zed_like_workspace();
    let root = tmp.path();
    let manifest = format!(
        "{ROOT_MANIFEST}\n[profile.dev.package.zed]\nopt-level = 1\n\n[profile.dev.package.gpui]\nopt-level = 3\n\n[profile.release.package.\"*\"]\ncodegen-units = 1\n\n[profile.release.package.taffy]\nopt-level = 3\n"
    );
    write(root, "Cargo.toml", &manifest);

    let report = transform(root, &CarveConfig::default()).unwrap();
    let removed: Vec<(&str, &str)> = report
        .rewrite
        .workspace
        .profile_removals
        .iter()
        .map(|o| (o.profile.as_str(), o.package.as_str()))
        .collect();
    assert_eq!(removed, vec![("dev", "zed")]);

    let ws = read_workspace(root).unwrap();
    let left: Vec<(&str, &str)> = ws
        .profile_overrides
        .iter()
        .map(|o| (o.profile.as_str(), o.package.as_str()))
        .collect();
    assert_eq!(left, vec![("dev", "gpui"), ("release", "*"), ("release", "taffy")]);
    assert!(read(root, "Cargo.toml").contains("[profile.dev.package.gpui]\nopt-level = 3"));
}

#[test]
fn test_crate_cleanup_is_opt_in() {
    let files = ["crates/gpui/README.md", "crates/util/CHANGELOG.md", "crates/util/docs/api.md"];
    let tmp = zed_like_workspace();
    let root = tmp.path();
    for file in files {
        write(root, file, "notes\n");
    }
    transform(root, &CarveConfig::default()).unwrap();
    for file in files {
        assert!(root.join(file).exists(), "{file} should survive by default");
    }

    let tmp = zed_like_workspace();
    let root = tmp.path();
    for file in files {
        write(root, file, "notes\n");
    }
    let mut config = CarveConfig::default();
    config.prune.crate_exclude = vec!["docs".into(), "CHANGELOG*".into(), "*.md".into()];
    config.prune.crate_keep = vec!["crates/gpui/README.md".into()];
    transform(root, &config).unwrap();
    assert!(root.join("crates/gpui/README.md").exists());
    assert!(!root.join("crates/util/CHANGELOG.md").exists());
    assert!(!root.join("crates/util/docs").exists());
    assert!(root.join("crates/util/src/lib.rs").exists());
}
