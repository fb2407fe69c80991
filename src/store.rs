use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::digest::compute_sha256;
use crate::job::JobResult;

pub const RESULT_FILE: &str = "result.json";
pub const LOG_FILE: &str = "job.log";
pub const CHECKSUM_FILE: &str = "SHA256SUMS";

/// Filesystem artifact store shared by all jobs of a run. Layout:
/// `<root>/<run_id>/<job_id>/` holding copied artifacts plus the job's
/// `result.json`, `job.log`, and `SHA256SUMS`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create artifact store: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn job_dir(&self, run_id: &str, job_id: &str) -> PathBuf {
        self.run_dir(run_id).join(job_id)
    }

    /// Copy a produced file into the job's store directory. Returns the
    /// stored file name and its sha256 digest.
    pub fn put_artifact(
        &self,
        run_id: &str,
        job_id: &str,
        source: &Path,
    ) -> Result<(String, String)> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Artifact has no usable file name: {}", source.display()))?
            .to_string();
        let dir = self.job_dir(run_id, job_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job directory: {}", dir.display()))?;
        let dest = dir.join(&name);
        fs::copy(source, &dest).with_context(|| {
            format!(
                "Failed to copy artifact '{}' into store",
                source.display()
            )
        })?;
        let digest = compute_sha256(&dest)?;
        Ok((name, digest))
    }

    pub fn write_log(&self, run_id: &str, job_id: &str, contents: &str) -> Result<PathBuf> {
        let dir = self.job_dir(run_id, job_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job directory: {}", dir.display()))?;
        let path = dir.join(LOG_FILE);
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write job log: {}", path.display()))?;
        Ok(path)
    }

    pub fn write_checksums(
        &self,
        run_id: &str,
        job_id: &str,
        digests: &[(String, String)],
    ) -> Result<()> {
        let path = self.job_dir(run_id, job_id).join(CHECKSUM_FILE);
        let mut file = File::create(&path)
            .with_context(|| format!("Failed to create checksum file: {}", path.display()))?;
        for (name, digest) in digests {
            writeln!(file, "{digest}  {name}")
                .with_context(|| format!("Failed to write checksum file: {}", path.display()))?;
        }
        Ok(())
    }

    pub fn write_result(&self, run_id: &str, result: &JobResult) -> Result<()> {
        let dir = self.job_dir(run_id, &result.job_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job directory: {}", dir.display()))?;
        let path = dir.join(RESULT_FILE);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create result file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, result)
            .with_context(|| format!("Failed to write job result: {}", path.display()))?;
        Ok(())
    }

    /// Load the recorded result for a job, or `None` when the job never
    /// reported (treated by the aggregator as a permanent failure).
    pub fn load_result(&self, run_id: &str, job_id: &str) -> Result<Option<JobResult>> {
        let path = self.job_dir(run_id, job_id).join(RESULT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read job result: {}", path.display()))?;
        let result = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse job result: {}", path.display()))?;
        Ok(Some(result))
    }

    /// Absolute paths of a job's stored artifacts, in the order recorded in
    /// its result.
    pub fn artifact_paths(&self, run_id: &str, result: &JobResult) -> Vec<PathBuf> {
        let dir = self.job_dir(run_id, &result.job_id);
        result.artifacts.iter().map(|name| dir.join(name)).collect()
    }
}
