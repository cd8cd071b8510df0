//! Local transform driver: every stage of an extraction run, minus fetching
//! and publishing.

use crate::locations::CrateLocations;
use crate::prune::{PrunePlan, PruneReport, plan_prune};
use crate::rewrite::{RewritePlan, RewriteReport, apply_rewrite, plan_rewrite, verify};
use crate::stub::{StubPlan, dropped_dependencies, plan_stubs};
use crate::tree::FsTree;
use carve_core::Result;
use carve_core::config::CarveConfig;
use carve_core::graph::{DependencyGraph, KeepSet};
use carve_core::manifest::{WorkspaceManifest, read_all, read_workspace};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// The source workspace as read before any mutation, with its closure.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub workspace: WorkspaceManifest,
    pub graph: DependencyGraph,
    pub keep: KeepSet,
    /// Final directory of every kept crate.
    pub locations: CrateLocations,
}

impl Extraction {
    /// Read every manifest under `root` and compute the KeepSet.
    ///
    /// Dependencies that stubs drop are not edges: the closure is computed
    /// again without them, so their targets are pruned.
    pub fn analyze(root: &Path, config: &CarveConfig) -> Result<Self> {
        let workspace = read_workspace(root)?;
        let records = read_all(root, &workspace)?;
        let mut graph = DependencyGraph::build(records, config.extract.follow_dev_dependencies)?;
        let mut keep = graph.keep_set(&config.extract.root_crate)?;

        let current = CrateLocations::current(&graph, &keep);
        let dropped = dropped_dependencies(root, &current, &config.stubs)?;
        if !dropped.is_empty() {
            for (name, keys) in &dropped {
                tracing::debug!("{name}: not following {keys:?}, stubbed out");
            }
            graph = graph.without_dependencies(&dropped);
            keep = graph.keep_set(&config.extract.root_crate)?;
        }

        let locations = CrateLocations::resolve(&graph, &keep, &config.extract.relocate)?;
        tracing::info!(
            "keeping {} of {} crates for `{}`",
            keep.len(),
            graph.len(),
            keep.root()
        );
        Ok(Self {
            workspace,
            graph,
            keep,
            locations,
        })
    }

    pub fn plan_prune(&self, root: &Path, config: &CarveConfig) -> Result<PrunePlan> {
        plan_prune(
            &self.graph,
            &self.keep,
            &config.prune,
            &self.locations,
            &FsTree::new(root),
        )
    }

    pub fn prune(&self, root: &Path, config: &CarveConfig) -> Result<PruneReport> {
        self.plan_prune(root, config)?.apply(root)
    }

    /// Plan and apply stubs. Expects the tree to be pruned already.
    pub fn stub(&self, root: &Path, config: &CarveConfig) -> Result<StubPlan> {
        let plan = plan_stubs(root, &self.locations, &config.stubs)?;
        plan.apply(root)?;
        Ok(plan)
    }

    pub fn plan_rewrite(&self, stubs: &StubPlan) -> RewritePlan {
        plan_rewrite(
            &self.graph,
            &self.keep,
            &self.workspace,
            &self.locations,
            stubs,
        )
    }

    /// Rewrite manifests, then check nothing dangles.
    pub fn rewrite(&self, root: &Path, stubs: &StubPlan) -> Result<RewriteReport> {
        let report = apply_rewrite(root, &self.plan_rewrite(stubs))?;
        verify(root, &self.locations)?;
        Ok(report)
    }
}

/// Summary of a local transform, real or planned.
#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub dry_run: bool,
    pub keep: KeepSet,
    pub pruned_crates: Vec<String>,
    pub prune: PrunePlan,
    pub stubbed_files: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub rewrite: RewritePlan,
    pub manifests_written: Vec<PathBuf>,
}

impl TransformReport {
    fn new(extraction: &Extraction, prune: PrunePlan, stubs: &StubPlan, dry_run: bool) -> Self {
        Self {
            dry_run,
            keep: extraction.keep.clone(),
            pruned_crates: extraction
                .keep
                .pruned(&extraction.graph)
                .iter()
                .map(|r| r.name.clone())
                .collect(),
            prune,
            stubbed_files: stubs.edits.iter().map(|e| e.path.clone()).collect(),
            warnings: stubs.missing.iter().map(ToString::to_string).collect(),
            rewrite: extraction.plan_rewrite(stubs),
            manifests_written: Vec::new(),
        }
    }
}

/// Run graph build, prune, stub, rewrite and verify in place on `root`.
pub fn transform(root: &Path, config: &CarveConfig) -> Result<TransformReport> {
    let extraction = Extraction::analyze(root, config)?;
    let prune = extraction.plan_prune(root, config)?;
    prune.apply(root)?;
    let stubs = extraction.stub(root, config)?;
    let rewrite = extraction.rewrite(root, &stubs)?;

    let mut report = TransformReport::new(&extraction, prune, &stubs, false);
    report.manifests_written = rewrite.written;
    Ok(report)
}

/// Everything `transform` would do, without touching `root`. Stubs are
/// planned against the crates' current directories.
pub fn dry_run(root: &Path, config: &CarveConfig) -> Result<TransformReport> {
    let extraction = Extraction::analyze(root, config)?;
    let prune = extraction.plan_prune(root, config)?;
    prune.validate(root)?;
    let current = CrateLocations::current(&extraction.graph, &extraction.keep);
    let stubs = plan_stubs(root, &current, &config.stubs)?;
    Ok(TransformReport::new(&extraction, prune, &stubs, true))
}
