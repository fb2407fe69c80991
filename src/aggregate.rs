use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::store::ArtifactStore;

/// Join-barrier output for one run: the all-success gate plus the flattened
/// artifact list across every expected job.
#[derive(Debug, Serialize)]
pub struct AggregateGate {
    pub run_id: String,
    pub all_success: bool,
    pub expected: usize,
    pub completed: usize,
    pub jobs: Vec<JobSummary>,
    /// Absolute store paths, flattened in expected-job order.
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub success: bool,
    pub artifacts: usize,
    /// True when no result was recorded for an expected job. Missing jobs
    /// are permanently failed; there is no retry or polling beyond this
    /// single scan.
    pub missing: bool,
}

impl AggregateGate {
    pub fn wheels(&self) -> Vec<&Path> {
        self.artifacts
            .iter()
            .filter(|p| has_suffix(p, ".whl"))
            .map(PathBuf::as_path)
            .collect()
    }

    pub fn sdists(&self) -> Vec<&Path> {
        self.artifacts
            .iter()
            .filter(|p| has_suffix(p, ".tar.gz") || has_suffix(p, ".zip"))
            .map(PathBuf::as_path)
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|j| !j.success).count()
    }
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}

/// Scan the store for every expected job result and compute the gate.
pub fn aggregate(
    store: &ArtifactStore,
    run_id: &str,
    expected_job_ids: &[String],
) -> Result<AggregateGate> {
    let mut jobs = Vec::with_capacity(expected_job_ids.len());
    let mut artifacts = Vec::new();
    let mut completed = 0usize;
    let mut all_success = true;

    for job_id in expected_job_ids {
        match store.load_result(run_id, job_id)? {
            Some(result) => {
                completed += 1;
                if !result.success {
                    all_success = false;
                }
                artifacts.extend(store.artifact_paths(run_id, &result));
                jobs.push(JobSummary {
                    job_id: job_id.clone(),
                    success: result.success,
                    artifacts: result.artifacts.len(),
                    missing: false,
                });
            }
            None => {
                warn!(run_id, job = job_id.as_str(), "Expected job result missing");
                all_success = false;
                jobs.push(JobSummary {
                    job_id: job_id.clone(),
                    success: false,
                    artifacts: 0,
                    missing: true,
                });
            }
        }
    }

    Ok(AggregateGate {
        run_id: run_id.to_string(),
        all_success,
        expected: expected_job_ids.len(),
        completed,
        jobs,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobResult;
    use crate::matrix::MatrixEntry;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn stored_result(store: &ArtifactStore, run_id: &str, job_id: &str, success: bool) {
        let result = JobResult {
            job_id: job_id.to_string(),
            entry: MatrixEntry {
                job_id: job_id.to_string(),
                values: BTreeMap::new(),
                base_image: None,
                env: BTreeMap::new(),
            },
            success,
            steps: Vec::new(),
            artifacts: Vec::new(),
            log: "job.log".to_string(),
            duration_ms: 1,
        };
        store.write_result(run_id, &result).unwrap();
    }

    #[test]
    fn all_success_requires_every_expected_job() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::open(temp.path()).unwrap();
        stored_result(&store, "run-1", "linux-cp312", true);
        stored_result(&store, "run-1", "macos-cp312", true);

        let gate = aggregate(
            &store,
            "run-1",
            &["linux-cp312".to_string(), "macos-cp312".to_string()],
        )
        .unwrap();
        assert!(gate.all_success);
        assert_eq!(gate.completed, 2);
    }

    #[test]
    fn one_failed_job_flips_the_gate() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::open(temp.path()).unwrap();
        stored_result(&store, "run-1", "linux-cp312", true);
        stored_result(&store, "run-1", "windows-cp312", false);

        let gate = aggregate(
            &store,
            "run-1",
            &["linux-cp312".to_string(), "windows-cp312".to_string()],
        )
        .unwrap();
        assert!(!gate.all_success);
        assert_eq!(gate.failed_count(), 1);
    }

    #[test]
    fn missing_job_is_permanently_failed() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::open(temp.path()).unwrap();
        stored_result(&store, "run-1", "linux-cp312", true);

        let gate = aggregate(
            &store,
            "run-1",
            &["linux-cp312".to_string(), "macos-cp312".to_string()],
        )
        .unwrap();
        assert!(!gate.all_success);
        assert_eq!(gate.completed, 1);
        assert!(gate.jobs[1].missing);
    }

    #[test]
    fn wheels_and_sdists_split_by_suffix() {
        let gate = AggregateGate {
            run_id: "run-1".to_string(),
            all_success: true,
            expected: 1,
            completed: 1,
            jobs: Vec::new(),
            artifacts: vec![
                PathBuf::from("/s/r/j/pkg-1.0-cp312-linux.whl"),
                PathBuf::from("/s/r/j/pkg-1.0.tar.gz"),
                PathBuf::from("/s/r/j/job.log"),
            ],
        };
        assert_eq!(gate.wheels().len(), 1);
        assert_eq!(gate.sdists().len(), 1);
    }
}
