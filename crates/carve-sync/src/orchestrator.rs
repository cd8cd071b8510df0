//! Sync Orchestrator: one run is a linear walk through [`SyncState`], with
//! `Aborted` reachable from every state.

use crate::digest::TreeDigest;
use crate::transport::{DistributionRepo, DistributionState, PublishRequest, RunLock, SourceRepo};
use carve_core::config::CarveConfig;
use carve_core::graph::KeepSet;
use carve_core::{CarveError, ErrorKind, Result};
use carve_transform::Extraction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Stage of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Fetching,
    BuildingGraph,
    Pruning,
    Stubbing,
    Rewriting,
    Diffing,
    Committing,
    Done,
    Aborted,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fetching => "Fetching",
            Self::BuildingGraph => "BuildingGraph",
            Self::Pruning => "Pruning",
            Self::Stubbing => "Stubbing",
            Self::Rewriting => "Rewriting",
            Self::Diffing => "Diffing",
            Self::Committing => "Committing",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Published,
    /// The tree matched what was already published.
    NoOp,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub state: SyncState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything a run did, for logs, alerting and `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub state: SyncState,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<KeepSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<TreeDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<DistributionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_commit: Option<String>,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            state: SyncState::Fetching,
            outcome: Outcome::Aborted,
            error: None,
            warnings: Vec::new(),
            source_revision: None,
            keep: None,
            digest: None,
            previous: None,
            published_commit: None,
            transitions: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Process exit status: 0 for published and no-op runs.
    pub fn exit_code(&self) -> u8 {
        self.error.as_ref().map_or(0, |e| e.kind.exit_code())
    }

    /// States visited, in order.
    pub fn states(&self) -> Vec<SyncState> {
        self.transitions.iter().map(|t| t.state).collect()
    }

    fn enter(&mut self, state: SyncState) {
        if let Some(last) = self.transitions.last() {
            tracing::info!("sync: {} -> {state}", last.state);
        } else {
            tracing::info!("sync: {state}");
        }
        self.state = state;
        self.transitions.push(Transition {
            state,
            at: Utc::now(),
        });
    }
}

/// Shared flag checked between stages. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Publish even when the digest matches the distribution.
    pub force: bool,
    pub cancel: CancelToken,
}

pub struct Orchestrator<S, D, L> {
    source: S,
    distribution: D,
    lock: L,
    config: CarveConfig,
}

impl<S, D, L> Orchestrator<S, D, L>
where
    S: SourceRepo,
    D: DistributionRepo,
    L: RunLock,
{
    pub fn new(source: S, distribution: D, lock: L, config: CarveConfig) -> Self {
        Self {
            source,
            distribution,
            lock,
            config,
        }
    }

    pub fn config(&self) -> &CarveConfig {
        &self.config
    }

    /// One complete run. Failures end in `Aborted` and are recorded in the
    /// report rather than returned.
    pub fn run(&self, options: &RunOptions) -> SyncReport {
        let mut report = SyncReport::new();
        let result = self.execute(options, &mut report);
        report.finished_at = Utc::now();

        match result {
            Ok(outcome) => {
                report.outcome = outcome;
                report.enter(SyncState::Done);
                match outcome {
                    Outcome::NoOp => tracing::info!("sync: distribution already up to date"),
                    _ => tracing::info!(
                        "sync: published {}",
                        report.published_commit.as_deref().unwrap_or("?")
                    ),
                }
            }
            Err(e) => {
                tracing::error!("sync aborted in {}: {e}", report.state);
                report.outcome = Outcome::Aborted;
                report.error = Some(RunError {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                report.enter(SyncState::Aborted);
            }
        }
        report
    }

    /// Run every `interval` until `options.cancel` is set, handing each
    /// report to `on_report`.
    pub fn run_every(
        &self,
        interval: Duration,
        options: &RunOptions,
        mut on_report: impl FnMut(&SyncReport),
    ) {
        const TICK: Duration = Duration::from_secs(1);
        while !options.cancel.is_cancelled() {
            let report = self.run(options);
            on_report(&report);

            let mut waited = Duration::ZERO;
            while waited < interval && !options.cancel.is_cancelled() {
                let step = TICK.min(interval - waited);
                std::thread::sleep(step);
                waited += step;
            }
        }
    }

    fn workdir(&self) -> Result<tempfile::TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("carve-run-");
            b
        };
        match &self.config.sync.workdir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| CarveError::io(dir, e))?;
                builder.tempdir_in(dir).map_err(|e| CarveError::io(dir, e))
            }
            None => builder
                .tempdir()
                .map_err(|e| CarveError::io(std::env::temp_dir(), e)),
        }
    }

    fn execute(&self, options: &RunOptions, report: &mut SyncReport) -> Result<Outcome> {
        let cancel = &options.cancel;
        // Held until this function returns, covering Committing.
        let _guard = self.lock.acquire()?;
        let workdir = self.workdir()?;
        let tree: PathBuf = workdir.path().join("tree");

        stage(report, SyncState::Fetching, cancel)?;
        let snapshot = self.source.fetch(&tree)?;
        report.source_revision = Some(snapshot.revision.clone());

        stage(report, SyncState::BuildingGraph, cancel)?;
        let extraction = Extraction::analyze(&tree, &self.config)?;
        report.keep = Some(extraction.keep.clone());

        stage(report, SyncState::Pruning, cancel)?;
        extraction.prune(&tree, &self.config)?;

        stage(report, SyncState::Stubbing, cancel)?;
        let stubs = extraction.stub(&tree, &self.config)?;
        report
            .warnings
            .extend(stubs.missing.iter().map(ToString::to_string));

        stage(report, SyncState::Rewriting, cancel)?;
        extraction.rewrite(&tree, &stubs)?;

        stage(report, SyncState::Diffing, cancel)?;
        let digest = TreeDigest::compute(&tree)?;
        report.digest = Some(digest.clone());
        let previous = self.distribution.current_state()?;
        report.previous = previous.clone();
        let unchanged = previous.as_ref().and_then(|p| p.digest.as_ref()) == Some(&digest);
        if unchanged && !options.force {
            return Ok(Outcome::NoOp);
        }

        stage(report, SyncState::Committing, cancel)?;
        let request = PublishRequest {
            digest,
            source_revision: snapshot.revision.clone(),
            summary: format!(
                "Extract {} from {}",
                extraction.keep.root(),
                short(&snapshot.revision)
            ),
        };
        let commit = self.distribution.publish(&tree, &request)?;
        report.published_commit = Some(commit);
        Ok(Outcome::Published)
    }
}

/// Enter `state` unless the run was cancelled at this boundary.
fn stage(report: &mut SyncReport, state: SyncState, cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CarveError::Cancelled {
            stage: state.to_string(),
        });
    }
    report.enter(state);
    Ok(())
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}
