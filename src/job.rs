use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::matrix::MatrixEntry;
use crate::observability::MetricsCollector;
use crate::store::{ArtifactStore, LOG_FILE};
use crate::workflow::{Workflow, render_template};

/// One step of a job: an argv template executed in the job workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub run: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Collection steps marked `always_run` execute even after an earlier
    /// step has failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_run: bool,
}

/// Conditional gate on a step: every present field must match for the step
/// to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    /// Glob matched against the entry's `interpreter` dimension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    /// Glob matched against the full trigger ref (e.g. `refs/tags/v*`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_ref: Option<String>,
}

impl StepCondition {
    pub fn matches(&self, entry: &MatrixEntry, trigger_ref: Option<&str>) -> bool {
        if let Some(pattern) = &self.interpreter {
            let matched = entry.interpreter().is_some_and(|interpreter| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(interpreter))
                    .unwrap_or(false)
            });
            if !matched {
                return false;
            }
        }
        if let Some(pattern) = &self.trigger_ref {
            let matched = trigger_ref.is_some_and(|r| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(r))
                    .unwrap_or(false)
            });
            if !matched {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn passed(&self) -> bool {
        !matches!(self.status, StepStatus::Failed)
    }

    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
        }
    }
}

/// Outcome of one matrix job, persisted as `result.json` in the store.
/// `success` is true only when no executed step observed a non-zero exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub entry: MatrixEntry,
    pub success: bool,
    pub steps: Vec<StepRecord>,
    /// Stored artifact file names, in collection order.
    pub artifacts: Vec<String>,
    /// Log file name within the job's store directory.
    pub log: String,
    pub duration_ms: u64,
}

/// Executes one matrix entry: an ordered step sequence inside a disposable
/// workspace, followed by best-effort artifact and log collection into the
/// shared store.
pub struct JobRunner<'a> {
    workflow: &'a Workflow,
    store: &'a ArtifactStore,
    run_id: &'a str,
    trigger_ref: Option<&'a str>,
    metrics: &'a MetricsCollector,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        workflow: &'a Workflow,
        store: &'a ArtifactStore,
        run_id: &'a str,
        trigger_ref: Option<&'a str>,
        metrics: &'a MetricsCollector,
    ) -> Self {
        Self {
            workflow,
            store,
            run_id,
            trigger_ref,
            metrics,
        }
    }

    pub fn run(&self, entry: &MatrixEntry) -> Result<JobResult> {
        let start = Instant::now();

        // The workspace is dropped on every exit path, including errors.
        let workspace = TempDir::new().with_context(|| {
            format!("Failed to create workspace for job '{}'", entry.job_id)
        })?;
        let bindings = self.bindings(entry, workspace.path().to_string_lossy().as_ref());

        let mut log = String::new();
        let mut records = Vec::with_capacity(self.workflow.steps.len());
        let mut failed = false;

        for step in &self.workflow.steps {
            if let Some(condition) = &step.condition
                && !condition.matches(entry, self.trigger_ref)
            {
                let _ = writeln!(log, "-- {}: skipped (condition not met)", step.name);
                records.push(StepRecord::skipped(&step.name));
                continue;
            }
            if failed && !step.always_run {
                let _ = writeln!(log, "-- {}: skipped (earlier step failed)", step.name);
                records.push(StepRecord::skipped(&step.name));
                continue;
            }

            let _timer = self.metrics.start_step(&step.name);
            let record = self.run_step(step, entry, &workspace, &bindings, &mut log);
            if !record.passed() {
                if failed {
                    // Best-effort collection step after the job already failed.
                    warn!(
                        job = entry.job_id.as_str(),
                        step = step.name.as_str(),
                        "Always-run step failed after job failure"
                    );
                } else {
                    failed = true;
                }
            }
            records.push(record);
        }

        let artifacts = self.collect_artifacts(entry, &workspace, &bindings, &mut log);
        let success = !failed;

        if let Err(err) = self.store.write_log(self.run_id, &entry.job_id, &log) {
            warn!(job = entry.job_id.as_str(), "Failed to persist job log: {err:#}");
        }

        let result = JobResult {
            job_id: entry.job_id.clone(),
            entry: entry.clone(),
            success,
            steps: records,
            artifacts,
            log: LOG_FILE.to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.store.write_result(self.run_id, &result)?;
        self.metrics.record_job(success);

        info!(
            job = entry.job_id.as_str(),
            success,
            artifacts = result.artifacts.len(),
            duration_ms = result.duration_ms,
            "Job finished"
        );
        Ok(result)
    }

    fn run_step(
        &self,
        step: &StepSpec,
        entry: &MatrixEntry,
        workspace: &TempDir,
        bindings: &BTreeMap<String, String>,
        log: &mut String,
    ) -> StepRecord {
        let started = Instant::now();
        let argv: Vec<String> = step
            .run
            .iter()
            .map(|arg| render_template(arg, bindings))
            .collect();

        let _ = writeln!(log, "== {} ==", step.name);
        let _ = writeln!(log, "$ {}", argv.join(" "));

        let Some((program, args)) = argv.split_first() else {
            let _ = writeln!(log, "error: step has an empty command");
            return StepRecord {
                name: step.name.clone(),
                status: StepStatus::Failed,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        };

        let mut command = Command::new(program);
        command.args(args).current_dir(workspace.path());
        for (key, value) in self.step_env(step, entry, bindings) {
            command.env(key, value);
        }

        match command.output() {
            Ok(output) => {
                let exit_code = output.status.code();
                log.push_str(&String::from_utf8_lossy(&output.stdout));
                log.push_str(&String::from_utf8_lossy(&output.stderr));
                let status = if output.status.success() {
                    StepStatus::Passed
                } else {
                    let _ = writeln!(
                        log,
                        "error: step '{}' exited with {:?}",
                        step.name, exit_code
                    );
                    StepStatus::Failed
                };
                StepRecord {
                    name: step.name.clone(),
                    status,
                    exit_code,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(err) => {
                let _ = writeln!(log, "error: failed to spawn '{program}': {err}");
                StepRecord {
                    name: step.name.clone(),
                    status: StepStatus::Failed,
                    exit_code: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    /// Collect workspace artifacts into the store. Always runs, best effort:
    /// a missing pattern is logged, never escalated.
    fn collect_artifacts(
        &self,
        entry: &MatrixEntry,
        workspace: &TempDir,
        bindings: &BTreeMap<String, String>,
        log: &mut String,
    ) -> Vec<String> {
        let mut names = Vec::new();
        let mut digests = Vec::new();

        for pattern in &self.workflow.artifacts {
            let rendered = render_template(pattern, bindings);
            let full = workspace.path().join(&rendered);
            let matches = match glob::glob(&full.to_string_lossy()) {
                Ok(matches) => matches,
                Err(err) => {
                    let _ = writeln!(log, "warning: invalid artifact pattern '{rendered}': {err}");
                    continue;
                }
            };
            for path in matches.flatten() {
                if !path.is_file() {
                    continue;
                }
                match self.store.put_artifact(self.run_id, &entry.job_id, &path) {
                    Ok((name, digest)) => {
                        let _ = writeln!(log, "collected {name} ({digest})");
                        names.push(name.clone());
                        digests.push((name, digest));
                    }
                    Err(err) => {
                        let _ = writeln!(
                            log,
                            "warning: failed to store artifact '{}': {err:#}",
                            path.display()
                        );
                    }
                }
            }
        }

        if !digests.is_empty()
            && let Err(err) = self.store.write_checksums(self.run_id, &entry.job_id, &digests)
        {
            warn!(job = entry.job_id.as_str(), "Failed to write checksums: {err:#}");
        }

        names
    }

    fn bindings(&self, entry: &MatrixEntry, workspace: &str) -> BTreeMap<String, String> {
        let mut bindings = entry.values.clone();
        bindings.insert("workspace".to_string(), workspace.to_string());
        bindings.insert("run_id".to_string(), self.run_id.to_string());
        bindings.insert("job_id".to_string(), entry.job_id.clone());
        bindings.insert(
            "trigger_ref".to_string(),
            self.trigger_ref.unwrap_or_default().to_string(),
        );
        bindings.insert(
            "base_image".to_string(),
            entry.base_image.clone().unwrap_or_default(),
        );
        bindings
    }

    fn step_env(
        &self,
        step: &StepSpec,
        entry: &MatrixEntry,
        bindings: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("WW_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("WW_JOB_ID".to_string(), entry.job_id.clone());
        env.insert(
            "WW_TRIGGER_REF".to_string(),
            self.trigger_ref.unwrap_or_default().to_string(),
        );
        if let Some(base_image) = &entry.base_image {
            env.insert("WW_BASE_IMAGE".to_string(), base_image.clone());
        }
        for (dimension, value) in &entry.values {
            env.insert(
                format!("WW_{}", dimension.to_ascii_uppercase()),
                value.clone(),
            );
        }
        for (key, value) in &entry.env {
            env.insert(key.clone(), render_template(value, bindings));
        }
        for (key, value) in &step.env {
            env.insert(key.clone(), render_template(value, bindings));
        }
        env
    }
}

/// Run all matrix entries in parallel. Entries are independent and share no
/// mutable state; one entry's failure never cancels its siblings, so every
/// job runs to completion before the results are returned in matrix order.
pub fn run_matrix(
    workflow: &Workflow,
    entries: &[MatrixEntry],
    store: &ArtifactStore,
    run_id: &str,
    trigger_ref: Option<&str>,
    metrics: &MetricsCollector,
) -> Result<Vec<JobResult>> {
    let runner = JobRunner::new(workflow, store, run_id, trigger_ref, metrics);
    entries
        .par_iter()
        .map(|entry| runner.run(entry))
        .collect::<Result<Vec<_>>>()
}
