use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use wheelwright::aggregate::{AggregateGate, aggregate};
use wheelwright::digest::{compute_sha256, write_sha256};
use wheelwright::job::run_matrix;
use wheelwright::manifest::generate_manifest;
use wheelwright::matrix::MatrixEntry;
use wheelwright::observability::{MetricsCollector, log_snapshot};
use wheelwright::presets::generate_preset;
use wheelwright::publish::{
    CommandIndexClient, CommandReleaseApi, PublishError, ReleasePublisher,
};
use wheelwright::store::ArtifactStore;
use wheelwright::validation::validate_workflow;
use wheelwright::workflow::Workflow;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_BUILD_FAILED: u8 = 2;
const EXIT_PUBLISH_FAILED: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = configure_tracing() {
        eprintln!("Failed to initialise logging: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn dispatch(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Run {
            workflow,
            trigger_ref,
            run_id,
            store,
            owner,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => run_workflow(
            workflow,
            trigger_ref,
            run_id,
            store,
            owner,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        ),
        Commands::Expand { workflow, json } => expand_matrix(workflow, json),
        Commands::Validate { workflow } => validate_cmd(workflow),
        Commands::Job {
            workflow,
            index,
            run_id,
            store,
            trigger_ref,
        } => run_single_job(workflow, index, run_id, store, trigger_ref),
        Commands::Aggregate {
            workflow,
            run_id,
            store,
            json,
        } => aggregate_cmd(workflow, run_id, store, json),
        Commands::Publish {
            workflow,
            run_id,
            store,
            trigger_ref,
            owner,
        } => publish_cmd(workflow, run_id, store, trigger_ref, owner),
        Commands::Manifest { workflow, output } => manifest_cmd(workflow, output),
        Commands::Digest { path, output } => digest_cmd(path, output),
        Commands::Init { preset, output } => init_cmd(preset, output),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "wheelwright",
                &mut io::stdout(),
            );
            Ok(EXIT_OK)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_workflow(
    workflow_path: PathBuf,
    trigger_ref: Option<String>,
    run_id: Option<String>,
    store_root: PathBuf,
    owner: Option<String>,
    dry_run: bool,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<u8> {
    let workflow = load_validated(&workflow_path)?;
    let entries = workflow.matrix.expand()?;
    let run_id = run_id.unwrap_or_else(default_run_id);
    let owner = resolve_owner(owner);

    if dry_run {
        info!(
            run_id = run_id.as_str(),
            jobs = entries.len(),
            "Dry run: matrix expanded, nothing executed"
        );
        for entry in &entries {
            println!("{}", entry.job_id);
        }
        return Ok(EXIT_OK);
    }

    if entries.is_empty() {
        warn!("Matrix expanded to zero entries. Nothing to build.");
        return Ok(EXIT_OK);
    }

    let store = ArtifactStore::open(&store_root)?;
    let metrics = MetricsCollector::new();
    let total_start = Instant::now();

    generate_manifest(
        &workflow,
        &entries,
        &store.run_dir(&run_id).join("run-manifest.yaml"),
    )?;

    info!(run_id = run_id.as_str(), jobs = entries.len(), "Starting matrix run");
    let results = run_matrix(
        &workflow,
        &entries,
        &store,
        &run_id,
        trigger_ref.as_deref(),
        &metrics,
    )?;

    let expected: Vec<String> = entries.iter().map(|e| e.job_id.clone()).collect();
    let gate = aggregate(&store, &run_id, &expected)?;
    metrics.record_total_duration(total_start.elapsed());

    for result in &results {
        info!(
            job = result.job_id.as_str(),
            success = result.success,
            artifacts = result.artifacts.len(),
            "Job result"
        );
    }
    info!(
        run_id = run_id.as_str(),
        all_success = gate.all_success,
        artifacts = gate.artifacts.len(),
        "Matrix run complete"
    );

    let mut exit = if gate.all_success { EXIT_OK } else { EXIT_BUILD_FAILED };

    if let (Some(trigger_ref), Some(trigger)) = (trigger_ref.as_deref(), workflow.trigger.as_ref())
    {
        let release = workflow
            .release
            .clone()
            .context("Trigger configured without a release section")?;
        let mut publisher = ReleasePublisher::new(release.clone());
        if publisher.arm(trigger, trigger_ref, owner.as_deref()) {
            exit = run_publish(
                &mut publisher,
                &release,
                trigger_ref,
                &gate,
                &store,
                &run_id,
                &metrics,
            );
        } else {
            info!(
                trigger_ref,
                "Trigger did not match tag patterns or owner; skipping release"
            );
        }
    }

    emit_metrics(&metrics, print_metrics, metrics_json, metrics_prometheus)?;
    Ok(exit)
}

fn run_publish(
    publisher: &mut ReleasePublisher,
    release: &wheelwright::workflow::ReleaseSpec,
    trigger_ref: &str,
    gate: &AggregateGate,
    store: &ArtifactStore,
    run_id: &str,
    metrics: &MetricsCollector,
) -> u8 {
    let index = CommandIndexClient::new(release.upload.clone());
    let api = CommandReleaseApi::new(release.create_release.clone());
    let staging = store.run_dir(run_id).join("sdist");

    match publisher.publish(trigger_ref, gate, &index, &api, &staging, metrics) {
        Ok(outcome) => {
            info!(
                tag = outcome.tag.as_str(),
                version = outcome.version.as_str(),
                uploaded = outcome.uploaded.len(),
                url = outcome.release_url.as_str(),
                "Release published"
            );
            EXIT_OK
        }
        Err(PublishError::GateFailed { failed, expected }) => {
            error!(failed, expected, "Release gate failed; no upload attempted");
            EXIT_BUILD_FAILED
        }
        Err(err) => {
            error!("Release failed: {err}");
            EXIT_PUBLISH_FAILED
        }
    }
}

fn expand_matrix(workflow_path: PathBuf, json: bool) -> Result<u8> {
    let workflow = Workflow::load(&workflow_path)?;
    let entries = workflow.matrix.expand()?;
    if json {
        to_writer_pretty(io::stdout(), &entries)?;
        println!();
    } else {
        for entry in &entries {
            let values: Vec<String> = entry
                .values
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            println!("{}  [{}]", entry.job_id, values.join(", "));
        }
        println!("{} job(s)", entries.len());
    }
    Ok(EXIT_OK)
}

fn validate_cmd(workflow_path: PathBuf) -> Result<u8> {
    let workflow = Workflow::load(&workflow_path)?;
    let report = validate_workflow(&workflow);

    for warning in &report.warnings {
        warn!(file = %workflow_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %workflow_path.display(), "Workflow validation passed");
        Ok(EXIT_OK)
    } else {
        for error_msg in &report.errors {
            error!(file = %workflow_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Workflow validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn run_single_job(
    workflow_path: PathBuf,
    index: usize,
    run_id: Option<String>,
    store_root: PathBuf,
    trigger_ref: Option<String>,
) -> Result<u8> {
    let workflow = load_validated(&workflow_path)?;
    let entries = workflow.matrix.expand()?;
    let entry: &MatrixEntry = entries
        .get(index)
        .with_context(|| format!("Matrix has {} entries; index {index} is out of range", entries.len()))?;

    let run_id = run_id.unwrap_or_else(default_run_id);
    let store = ArtifactStore::open(&store_root)?;
    let metrics = MetricsCollector::new();
    let runner = wheelwright::job::JobRunner::new(
        &workflow,
        &store,
        &run_id,
        trigger_ref.as_deref(),
        &metrics,
    );
    let result = runner.run(entry)?;

    println!(
        "{}: {} ({} artifact(s))",
        result.job_id,
        if result.success { "passed" } else { "failed" },
        result.artifacts.len()
    );
    Ok(if result.success { EXIT_OK } else { EXIT_BUILD_FAILED })
}

fn aggregate_cmd(
    workflow_path: PathBuf,
    run_id: String,
    store_root: PathBuf,
    json: bool,
) -> Result<u8> {
    let workflow = Workflow::load(&workflow_path)?;
    let entries = workflow.matrix.expand()?;
    let expected: Vec<String> = entries.iter().map(|e| e.job_id.clone()).collect();

    let store = ArtifactStore::open(&store_root)?;
    let gate = aggregate(&store, &run_id, &expected)?;

    if json {
        to_writer_pretty(io::stdout(), &gate)?;
        println!();
    } else {
        for job in &gate.jobs {
            let status = if job.missing {
                "missing"
            } else if job.success {
                "passed"
            } else {
                "failed"
            };
            println!("{}: {} ({} artifact(s))", job.job_id, status, job.artifacts);
        }
        println!(
            "all-success: {} ({}/{} completed, {} artifact(s))",
            gate.all_success,
            gate.completed,
            gate.expected,
            gate.artifacts.len()
        );
    }
    Ok(if gate.all_success { EXIT_OK } else { EXIT_BUILD_FAILED })
}

fn publish_cmd(
    workflow_path: PathBuf,
    run_id: String,
    store_root: PathBuf,
    trigger_ref: String,
    owner: Option<String>,
) -> Result<u8> {
    let workflow = load_validated(&workflow_path)?;
    let trigger = workflow
        .trigger
        .clone()
        .context("Workflow has no trigger section; nothing can arm the publisher")?;
    let release = workflow
        .release
        .clone()
        .context("Workflow has no release section")?;

    let entries = workflow.matrix.expand()?;
    let expected: Vec<String> = entries.iter().map(|e| e.job_id.clone()).collect();
    let store = ArtifactStore::open(&store_root)?;
    let gate = aggregate(&store, &run_id, &expected)?;

    let owner = resolve_owner(owner);
    let mut publisher = ReleasePublisher::new(release.clone());
    if !publisher.arm(&trigger, &trigger_ref, owner.as_deref()) {
        warn!(
            trigger_ref = trigger_ref.as_str(),
            "Trigger ref did not match tag patterns or owner; publisher stays waiting"
        );
        return Ok(EXIT_CONFIG);
    }

    let metrics = MetricsCollector::new();
    Ok(run_publish(
        &mut publisher,
        &release,
        &trigger_ref,
        &gate,
        &store,
        &run_id,
        &metrics,
    ))
}

fn manifest_cmd(workflow_path: PathBuf, output: PathBuf) -> Result<u8> {
    let workflow = load_validated(&workflow_path)?;
    let entries = workflow.matrix.expand()?;
    generate_manifest(&workflow, &entries, &output)?;
    info!(
        manifest = %output.display(),
        jobs = entries.len(),
        "Run manifest generated"
    );
    Ok(EXIT_OK)
}

fn digest_cmd(path: PathBuf, output: Option<PathBuf>) -> Result<u8> {
    if let Some(out_path) = output {
        let digest = write_sha256(&path, &out_path)?;
        println!("{}  {}", digest, path.display());
        info!(
            file = %path.display(),
            digest_output = %out_path.display(),
            "SHA256 digest written"
        );
    } else {
        let digest = compute_sha256(&path)?;
        println!("{}  {}", digest, path.display());
    }
    Ok(EXIT_OK)
}

fn init_cmd(preset: String, output: Option<PathBuf>) -> Result<u8> {
    let destination = output.unwrap_or_else(|| PathBuf::from(format!("{preset}.yaml")));
    let generated = generate_preset(&preset, &destination)?;
    info!(
        preset = preset.as_str(),
        path = %generated.display(),
        "Preset workflow generated"
    );
    Ok(EXIT_OK)
}

fn load_validated(workflow_path: &PathBuf) -> Result<Workflow> {
    let workflow = Workflow::load(workflow_path)?;
    let report = validate_workflow(&workflow);
    for warning in &report.warnings {
        warn!(file = %workflow_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %workflow_path.display(), "{error_msg}");
        }
        anyhow::bail!(
            "Workflow validation failed with {} error(s)",
            report.errors.len()
        );
    }
    Ok(workflow)
}

fn emit_metrics(
    metrics: &MetricsCollector,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    if !print_metrics && metrics_json.is_none() && metrics_prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        std::fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn default_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%d%H%M%S"))
}

fn resolve_owner(owner: Option<String>) -> Option<String> {
    owner.or_else(|| std::env::var("WW_REPOSITORY_OWNER").ok())
}

#[derive(Parser)]
#[command(
    name = "wheelwright",
    version,
    about = "Multi-target build-and-release orchestrator",
    long_about = "Expands a declarative build matrix, runs each job's steps in a \
disposable workspace, aggregates artifacts into a run-keyed store, and on a \
matching version tag uploads wheels (before the sdist) and creates a release.\n\n\
Exit codes: 0 success, 1 usage or configuration error, 2 build failure, \
3 upload or release failure."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full workflow: expand, build, aggregate, and (on a matching
    /// tag) publish.
    Run {
        workflow: PathBuf,
        /// Triggering ref, e.g. refs/tags/v1.2.3.
        #[arg(long = "ref")]
        trigger_ref: Option<String>,
        #[arg(long = "run-id")]
        run_id: Option<String>,
        #[arg(long, default_value = ".wheelwright/store")]
        store: PathBuf,
        /// Repository owner for the release gate (falls back to
        /// WW_REPOSITORY_OWNER).
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// Print the expanded build matrix.
    Expand {
        workflow: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow file.
    Validate { workflow: PathBuf },
    /// Run a single matrix entry by index.
    Job {
        workflow: PathBuf,
        index: usize,
        #[arg(long = "run-id")]
        run_id: Option<String>,
        #[arg(long, default_value = ".wheelwright/store")]
        store: PathBuf,
        #[arg(long = "ref")]
        trigger_ref: Option<String>,
    },
    /// Re-read a store and print the all-success gate for a run.
    Aggregate {
        workflow: PathBuf,
        #[arg(long = "run-id")]
        run_id: String,
        #[arg(long, default_value = ".wheelwright/store")]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Publish a completed run: gate check, sdist build, ordered uploads,
    /// release record.
    Publish {
        workflow: PathBuf,
        #[arg(long = "run-id")]
        run_id: String,
        #[arg(long, default_value = ".wheelwright/store")]
        store: PathBuf,
        #[arg(long = "ref")]
        trigger_ref: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Write the run manifest (hashed job plans) for a workflow.
    Manifest {
        workflow: PathBuf,
        #[arg(long, default_value = "run-manifest.yaml")]
        output: PathBuf,
    },
    /// Compute a file's SHA256 digest.
    Digest {
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generate a starter workflow from a preset.
    Init {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
