//! CLI binary for carve: extract a crate and its local dependencies from a
//! Cargo workspace and keep a distribution repository in sync with it.

use anyhow::{Context, Result};
use carve_core::CarveError;
use carve_core::config::{CONFIG_FILE, CarveConfig};
use carve_sync::git::{GitDistribution, GitSource};
use carve_sync::lock::FileRunLock;
use carve_sync::{Orchestrator, Outcome, RunOptions, SyncReport, TreeDigest};
use carve_transform::TransformReport;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "carve", about = "Extract a crate subset from a Cargo workspace")]
struct Cli {
    /// Config file (defaults to ./carve.toml; missing file means defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch upstream, extract, and publish to the distribution if changed
    Sync {
        /// Publish even if the distribution already has this tree
        #[arg(long)]
        force: bool,

        /// Keep running, one sync every SECS seconds (0 = sync.interval_secs)
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Transform a local checkout in place (no fetch, no publish)
    Extract {
        /// Workspace root of the checkout
        dir: PathBuf,

        /// Show what would change without touching the tree
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the set of crates kept for the root crate
    Deps {
        /// Workspace root
        dir: PathBuf,

        /// Root crate (defaults to extract.root_crate)
        #[arg(long)]
        root: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print the content digest of a tree
    Digest {
        dir: PathBuf,
    },
}

fn load_config(cli: &Cli) -> Result<CarveConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    CarveConfig::load(&path).map_err(|e| CarveError::Config(format!("{e:#}")).into())
}

/// Exit status for a failed command: the error kind's code when the failure
/// came from carve itself, 1 otherwise.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|e| e.downcast_ref::<CarveError>())
        .map_or(1, |e| e.kind().exit_code())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: &Cli) -> Result<u8> {
    let config = load_config(cli)?;
    match &cli.command {
        Commands::Sync { force, every, json } => cmd_sync(config, *force, *every, *json),
        Commands::Extract { dir, dry_run, json } => cmd_extract(&config, dir, *dry_run, *json),
        Commands::Deps { dir, root, json } => cmd_deps(config, dir, root.clone(), *json),
        Commands::Digest { dir } => cmd_digest(dir),
    }
}

fn cmd_sync(config: CarveConfig, force: bool, every: Option<u64>, json: bool) -> Result<u8> {
    let sync = &config.sync;
    let upstream = sync
        .upstream_url
        .clone()
        .ok_or_else(|| CarveError::Config("sync.upstream_url is not set".to_string()))?;
    let distribution = sync
        .distribution_url
        .clone()
        .ok_or_else(|| CarveError::Config("sync.distribution_url is not set".to_string()))?;

    let source = GitSource::new(upstream, sync.upstream_branch.clone(), sync);
    let dist = GitDistribution::new(distribution, sync.distribution_branch.clone(), sync);
    let lock = FileRunLock::new(
        sync.lock_path.clone(),
        Duration::from_secs(sync.lock_stale_secs),
    );
    let interval = every.map(|secs| {
        Duration::from_secs(if secs == 0 { sync.interval_secs } else { secs })
    });

    let orchestrator = Orchestrator::new(source, dist, lock, config);
    let options = RunOptions {
        force,
        ..RunOptions::default()
    };

    if let Some(interval) = interval {
        let cancel = options.cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::warn!("interrupted; stopping after the current stage");
            cancel.cancel();
        }) {
            tracing::warn!("could not install signal handler: {e}");
        }
        tracing::info!("syncing every {}s", interval.as_secs());
        orchestrator.run_every(interval, &options, |report| print_sync_report(report, json));
        return Ok(0);
    }

    let report = orchestrator.run(&options);
    print_sync_report(&report, json);
    Ok(report.exit_code())
}

fn print_sync_report(report: &SyncReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("failed to serialize report: {e}"),
        }
        return;
    }

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    let elapsed = report.finished_at - report.started_at;
    match report.outcome {
        Outcome::Published => eprintln!(
            "Published {} ({}) in {}s",
            report.published_commit.as_deref().unwrap_or("?"),
            report.digest.as_ref().map_or("", TreeDigest::as_str),
            elapsed.num_seconds()
        ),
        Outcome::NoOp => eprintln!("Distribution already up to date."),
        Outcome::Aborted => {
            if let Some(error) = &report.error {
                let stage = report.states().iter().rev().nth(1).copied();
                match stage {
                    Some(stage) => eprintln!("Aborted in {stage}: [{}] {}", error.kind, error.message),
                    None => eprintln!("Aborted: [{}] {}", error.kind, error.message),
                }
            }
        }
    }
}

fn cmd_extract(config: &CarveConfig, dir: &Path, dry_run: bool, json: bool) -> Result<u8> {
    use indicatif::{ProgressBar, ProgressStyle};

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Extracting `{}`...", config.extract.root_crate));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = if dry_run {
        carve_transform::dry_run(dir, config)
    } else {
        carve_transform::transform(dir, config)
    };
    spinner.finish_and_clear();
    let report = result.with_context(|| format!("failed to extract {}", dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_transform_report(&report);
    }
    Ok(0)
}

fn print_transform_report(report: &TransformReport) {
    let (delete, relocate) = if report.dry_run {
        ("Would delete", "Would move")
    } else {
        ("Deleted", "Moved")
    };
    eprintln!(
        "Kept {} crate(s) for `{}`: {}",
        report.keep.len(),
        report.keep.root(),
        report.keep.iter().collect::<Vec<_>>().join(", ")
    );
    if !report.pruned_crates.is_empty() {
        eprintln!("  Pruned crates: {}", report.pruned_crates.join(", "));
    }
    eprintln!("  {delete} {} path(s)", report.prune.deletions.len());
    for path in &report.prune.deletions {
        eprintln!("    - {}", path.display());
    }
    for mv in &report.prune.moves {
        eprintln!(
            "  {relocate} {}: {} -> {}",
            mv.crate_name,
            mv.from.display(),
            mv.to.display()
        );
    }
    if !report.stubbed_files.is_empty() {
        eprintln!("  Stubbed {} file(s)", report.stubbed_files.len());
    }
    eprintln!("  Crate manifests to rewrite: {}", report.rewrite.crates.len());
    if !report.dry_run {
        eprintln!("  Manifests written: {}", report.manifests_written.len());
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

fn cmd_deps(mut config: CarveConfig, dir: &Path, root: Option<String>, json: bool) -> Result<u8> {
    if let Some(root) = root {
        config.extract.root_crate = root;
    }
    let extraction = carve_transform::Extraction::analyze(dir, &config)?;
    let keep = &extraction.keep;

    if json {
        println!("{}", serde_json::to_string_pretty(keep)?);
        return Ok(0);
    }

    for name in keep.iter() {
        let dir = extraction
            .graph
            .record(name)
            .map(|r| r.dir.display().to_string())
            .unwrap_or_default();
        let marker = if name == keep.root() { " (root)" } else { "" };
        println!("{name}\t{dir}{marker}");
    }
    eprintln!("{} of {} crates kept", keep.len(), extraction.graph.len());
    Ok(0)
}

fn cmd_digest(dir: &Path) -> Result<u8> {
    let digest = TreeDigest::compute(dir)?;
    println!("{digest}");
    Ok(0)
}
