//! Full sync runs against in-memory source and distribution repositories.

use carve_core::config::{CarveConfig, StubKind, StubTarget};
use carve_core::{CarveError, ErrorKind, Result};
use carve_sync::lock::{FileLock, FileRunLock};
use carve_sync::{
    CancelToken, DistributionRepo, DistributionState, Orchestrator, Outcome, PublishRequest,
    RunOptions, SourceRepo, SourceSnapshot, SyncState, TreeDigest,
};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

const ROOT_MANIFEST: &str = r#"[workspace]
members = ["crates/gpui", "crates/util", "crates/zed"]

[workspace.dependencies]
util = { path = "crates/util" }
"#;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

struct FakeSource {
    revision: String,
    root_manifest: String,
    /// Cancelled while the fetch is in flight.
    cancel_during_fetch: Option<CancelToken>,
}

impl FakeSource {
    fn new(revision: &str) -> Self {
        Self {
            revision: revision.to_string(),
            root_manifest: ROOT_MANIFEST.to_string(),
            cancel_during_fetch: None,
        }
    }
}

impl SourceRepo for FakeSource {
    fn fetch(&self, dest: &Path) -> Result<SourceSnapshot> {
        write(dest, "Cargo.toml", &self.root_manifest);
        write(dest, "README.md", "# gpui\n");
        write(dest, "docs/intro.md", "hello\n");
        write(
            dest,
            "crates/gpui/Cargo.toml",
            "[package]\nname = \"gpui\"\nversion = \"0.1.0\"\n\n[dependencies]\nutil.workspace = true\n",
        );
        write(dest, "crates/gpui/src/lib.rs", &format!("// {}\npub fn run() {{}}\n", self.revision));
        write(
            dest,
            "crates/util/Cargo.toml",
            "[package]\nname = \"util\"\nversion = \"0.1.0\"\n",
        );
        write(dest, "crates/util/src/lib.rs", "");
        write(
            dest,
            "crates/zed/Cargo.toml",
            "[package]\nname = \"zed\"\nversion = \"0.1.0\"\n\n[dependencies]\ngpui = { path = \"../gpui\" }\n",
        );
        write(dest, "crates/zed/src/main.rs", "fn main() {}\n");
        if let Some(token) = &self.cancel_during_fetch {
            token.cancel();
        }
        Ok(SourceSnapshot {
            revision: self.revision.clone(),
        })
    }
}

#[derive(Default)]
struct FakeDistribution {
    state: Mutex<Option<DistributionState>>,
    published: Mutex<Vec<(PublishRequest, Vec<String>)>>,
    fail_publish: bool,
}

impl FakeDistribution {
    fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

impl DistributionRepo for &FakeDistribution {
    fn current_state(&self) -> Result<Option<DistributionState>> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn publish(&self, tree: &Path, request: &PublishRequest) -> Result<String> {
        if self.fail_publish {
            return Err(CarveError::Transport {
                operation: "push distribution".to_string(),
                reason: "connection reset".to_string(),
            });
        }
        let mut entries: Vec<String> = std::fs::read_dir(tree)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();

        let mut published = self.published.lock().unwrap();
        let commit = format!("commit-{}", published.len() + 1);
        published.push((request.clone(), entries));
        *self.state.lock().unwrap() = Some(DistributionState {
            commit: commit.clone(),
            digest: Some(request.digest.clone()),
        });
        Ok(commit)
    }
}

struct Harness {
    _tmp: TempDir,
    config: CarveConfig,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = CarveConfig::default();
        config.sync.lock_path = tmp.path().join("carve.lock");
        config.sync.workdir = Some(tmp.path().join("work"));
        Self { _tmp: tmp, config }
    }

    fn lock(&self) -> FileRunLock {
        FileRunLock::new(&self.config.sync.lock_path, Duration::from_secs(3600))
    }

    fn orchestrator<'d>(
        &self,
        source: FakeSource,
        distribution: &'d FakeDistribution,
    ) -> Orchestrator<FakeSource, &'d FakeDistribution, FileRunLock> {
        Orchestrator::new(source, distribution, self.lock(), self.config.clone())
    }
}

#[test]
fn test_first_run_publishes_then_second_is_no_op() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();

    let first = harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    assert_eq!(first.outcome, Outcome::Published, "{:?}", first.error);
    assert_eq!(
        first.states(),
        vec![
            SyncState::Fetching,
            SyncState::BuildingGraph,
            SyncState::Pruning,
            SyncState::Stubbing,
            SyncState::Rewriting,
            SyncState::Diffing,
            SyncState::Committing,
            SyncState::Done,
        ]
    );
    assert_eq!(first.published_commit.as_deref(), Some("commit-1"));
    assert_eq!(first.exit_code(), 0);
    assert!(first.keep.as_ref().unwrap().contains("util"));
    assert!(!first.keep.as_ref().unwrap().contains("zed"));

    let published = dist.published.lock().unwrap().clone();
    let (request, entries) = &published[0];
    assert_eq!(request.source_revision, "aaaa");
    assert_eq!(entries, &vec!["Cargo.toml", "README.md", "crates"]);

    let second = harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    assert_eq!(second.outcome, Outcome::NoOp);
    assert_eq!(second.state, SyncState::Done);
    assert!(!second.states().contains(&SyncState::Committing));
    assert_eq!(second.digest, first.digest);
    assert_eq!(dist.publish_count(), 1);
    assert!(!harness.config.sync.lock_path.exists(), "lock released");
}

#[test]
fn test_changed_source_publishes_again() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    let report = harness
        .orchestrator(FakeSource::new("bbbb"), &dist)
        .run(&RunOptions::default());
    assert_eq!(report.outcome, Outcome::Published);
    assert_ne!(report.previous.as_ref().unwrap().digest, report.digest);
    assert_eq!(dist.publish_count(), 2);
}

#[test]
fn test_force_publishes_identical_tree() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());

    let options = RunOptions {
        force: true,
        ..RunOptions::default()
    };
    let report = harness.orchestrator(FakeSource::new("aaaa"), &dist).run(&options);
    assert_eq!(report.outcome, Outcome::Published);
    assert_eq!(dist.publish_count(), 2);
}

#[test]
fn test_dangling_reference_aborts_without_publishing() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    let mut source = FakeSource::new("aaaa");
    source.root_manifest = format!("{ROOT_MANIFEST}\n[patch.crates-io]\nzed = {{ path = \"crates/zed\" }}\n");

    let report = harness.orchestrator(source, &dist).run(&RunOptions::default());
    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.state, SyncState::Aborted);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::DanglingDependencyReference);
    assert_eq!(report.exit_code(), 15);
    assert_eq!(
        report.states().iter().rev().nth(1),
        Some(&SyncState::Rewriting)
    );
    assert_eq!(dist.publish_count(), 0);
    assert!(dist.state.lock().unwrap().is_none());
}

#[test]
fn test_missing_stub_target_is_a_warning() {
    let mut harness = Harness::new();
    harness.config.stubs.push(StubTarget {
        name: "telemetry_event".to_string(),
        kind: StubKind::Macro,
        expansion: None,
        replacement: None,
        drop_dependencies: Vec::new(),
        crate_name: None,
    });
    let dist = FakeDistribution::default();

    let report = harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    assert_eq!(report.outcome, Outcome::Published);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("telemetry_event"));
}

#[test]
fn test_cancellation_stops_before_next_stage() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    let cancel = CancelToken::new();
    let mut source = FakeSource::new("aaaa");
    source.cancel_during_fetch = Some(cancel.clone());

    let options = RunOptions {
        force: false,
        cancel,
    };
    let report = harness.orchestrator(source, &dist).run(&options);
    assert_eq!(report.outcome, Outcome::Aborted);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert!(error.message.contains("BuildingGraph"));
    assert_eq!(report.states(), vec![SyncState::Fetching, SyncState::Aborted]);
    assert_eq!(dist.publish_count(), 0);
}

#[test]
fn test_failed_publish_leaves_distribution_unchanged() {
    let harness = Harness::new();
    let dist = FakeDistribution {
        fail_publish: true,
        ..FakeDistribution::default()
    };
    let report = harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::Transport);
    assert!(report.states().contains(&SyncState::Committing));
    assert!(dist.state.lock().unwrap().is_none());
    assert!(!harness.config.sync.lock_path.exists(), "lock released on failure");
}

#[test]
fn test_held_lock_rejects_run() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    let _held = FileLock::acquire(&harness.config.sync.lock_path, Duration::from_secs(3600)).unwrap();

    let report = harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::RunLocked);
    assert_eq!(report.states(), vec![SyncState::Aborted]);
    assert_eq!(dist.publish_count(), 0);
}

#[test]
fn test_report_serializes_with_snake_case_states() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    let report = harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run(&RunOptions::default());
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["state"], "done");
    assert_eq!(json["outcome"], "published");
    assert_eq!(json["transitions"][1]["state"], "building_graph");
    let digest = TreeDigest::parse(json["digest"].as_str().unwrap()).unwrap();
    assert_eq!(Some(digest), report.digest);
}

#[test]
fn test_periodic_sync_stops_when_cancelled() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    let options = RunOptions::default();
    let mut outcomes = Vec::new();

    harness
        .orchestrator(FakeSource::new("aaaa"), &dist)
        .run_every(Duration::from_millis(5), &options, |report| {
            outcomes.push(report.outcome);
            if outcomes.len() == 2 {
                options.cancel.cancel();
            }
        });
    assert_eq!(outcomes, vec![Outcome::Published, Outcome::NoOp]);
    assert_eq!(dist.publish_count(), 1);
}

#[test]
fn test_cancel_from_another_thread_ends_the_wait() {
    let harness = Harness::new();
    let dist = FakeDistribution::default();
    let options = RunOptions::default();
    let cancel = options.cancel.clone();

    let started = std::time::Instant::now();
    std::thread::scope(|scope| {
        scope.spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        harness
            .orchestrator(FakeSource::new("aaaa"), &dist)
            .run_every(Duration::from_secs(3600), &options, |_| {});
    });
    assert!(started.elapsed() < Duration::from_secs(30));
}
