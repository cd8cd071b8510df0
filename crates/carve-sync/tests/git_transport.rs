//! Git source and distribution against repositories on the local filesystem.

use carve_core::config::SyncConfig;
use carve_sync::git::{DIGEST_TRAILER, GitDistribution, GitSource, trailer};
use carve_sync::{DistributionRepo, PublishRequest, SourceRepo, TreeDigest};
use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature};
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn config() -> SyncConfig {
    SyncConfig {
        timeout_secs: 30,
        retries: 1,
        ..SyncConfig::default()
    }
}

/// Non-bare repository with one commit on `main`. Returns the commit id.
fn upstream(dir: &Path) -> String {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir, &opts).unwrap();
    write(dir, "Cargo.toml", "[workspace]\nmembers = [\"crates/gpui\"]\n");
    write(dir, "crates/gpui/src/lib.rs", "pub fn run() {}\n");

    let mut index = repo.index().unwrap();
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("upstream", "upstream@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap()
        .to_string()
}

fn url(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[test]
fn test_source_fetch_materializes_plain_tree() {
    let tmp = TempDir::new().unwrap();
    let origin = tmp.path().join("origin");
    let revision = upstream(&origin);

    let source = GitSource::new(url(&origin), "main", &config()).without_depth();
    let dest = tmp.path().join("run/tree");
    let snapshot = source.fetch(&dest).unwrap();

    assert_eq!(snapshot.revision, revision);
    assert!(dest.join("crates/gpui/src/lib.rs").exists());
    assert!(!dest.join(".git").exists());
}

#[test]
fn test_source_fetch_of_unknown_branch_fails() {
    let tmp = TempDir::new().unwrap();
    let origin = tmp.path().join("origin");
    upstream(&origin);

    let source = GitSource::new(url(&origin), "no-such-branch", &config()).without_depth();
    assert!(source.fetch(&tmp.path().join("tree")).is_err());
}

#[test]
fn test_distribution_publish_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let remote = tmp.path().join("dist.git");
    Repository::init_bare(&remote).unwrap();
    let dist = GitDistribution::new(url(&remote), "main", &config()).without_depth();

    assert_eq!(dist.current_state().unwrap(), None);

    let tree = tmp.path().join("tree");
    write(&tree, "Cargo.toml", "[workspace]\n");
    write(&tree, "crates/gpui/src/lib.rs", "");
    // Ignore rules from upstream must not hide files from the publish.
    write(&tree, ".gitignore", "*.rs\n");
    let digest = TreeDigest::compute(&tree).unwrap();
    let request = PublishRequest {
        digest: digest.clone(),
        source_revision: "abc123".to_string(),
        summary: "Extract gpui from abc123".to_string(),
    };

    let commit = dist.publish(&tree, &request).unwrap();
    assert!(!tree.join(".git").exists());

    let state = dist.current_state().unwrap().unwrap();
    assert_eq!(state.commit, commit);
    assert_eq!(state.digest, Some(digest));

    let repo = Repository::open_bare(&remote).unwrap();
    let head = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    assert_eq!(head.parent_count(), 0);
    assert!(
        head.tree()
            .unwrap()
            .get_path(Path::new("crates/gpui/src/lib.rs"))
            .is_ok()
    );
    assert!(trailer(head.message().unwrap(), DIGEST_TRAILER).is_some());
}

#[test]
fn test_republish_replaces_history() {
    let tmp = TempDir::new().unwrap();
    let remote = tmp.path().join("dist.git");
    Repository::init_bare(&remote).unwrap();
    let dist = GitDistribution::new(url(&remote), "main", &config()).without_depth();

    for (i, body) in ["one", "two"].iter().enumerate() {
        let tree = tmp.path().join(format!("tree-{i}"));
        write(&tree, "Cargo.toml", body);
        let request = PublishRequest {
            digest: TreeDigest::compute(&tree).unwrap(),
            source_revision: format!("rev{i}"),
            summary: "Extract gpui".to_string(),
        };
        dist.publish(&tree, &request).unwrap();
    }

    let repo = Repository::open_bare(&remote).unwrap();
    let head = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    assert_eq!(head.parent_count(), 0);
    assert!(head.message().unwrap().contains("rev1"));
}
