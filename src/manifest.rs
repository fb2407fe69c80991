use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::matrix::MatrixEntry;
use crate::workflow::{Workflow, render_template};

/// Record of an expanded run: one hashed job plan per matrix entry.
/// Identical workflow and matrix input yields identical job hashes, which is
/// what makes rerun comparisons meaningful.
#[derive(Debug, Serialize)]
pub struct RunManifest {
    pub workflow_version: u32,
    pub generated_at: DateTime<Utc>,
    pub dimensions: Vec<String>,
    pub jobs: Vec<JobManifest>,
}

#[derive(Debug, Serialize)]
pub struct JobManifest {
    pub job_id: String,
    pub values: BTreeMap<String, String>,
    pub steps_hash: String,
}

pub fn generate_manifest(
    workflow: &Workflow,
    entries: &[MatrixEntry],
    path: &Path,
) -> Result<()> {
    let manifest = RunManifest {
        workflow_version: workflow.version,
        generated_at: Utc::now(),
        dimensions: workflow.matrix.dimensions.keys().cloned().collect(),
        jobs: entries
            .iter()
            .map(|entry| JobManifest {
                job_id: entry.job_id.clone(),
                values: entry.values.clone(),
                steps_hash: hash_steps(workflow, entry),
            })
            .collect(),
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create manifest directory: {}", parent.display())
        })?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create manifest: {}", path.display()))?;
    serde_yaml::to_writer(file, &manifest)
        .with_context(|| format!("Failed to write manifest: {}", path.display()))?;

    Ok(())
}

/// Hash the step sequence as it resolves for one entry: rendered argv, env,
/// and condition text in order.
fn hash_steps(workflow: &Workflow, entry: &MatrixEntry) -> String {
    let mut hasher = Sha256::new();
    for step in &workflow.steps {
        hasher.update(step.name.as_bytes());
        for arg in &step.run {
            hasher.update(render_template(arg, &entry.values).as_bytes());
            hasher.update([0u8]);
        }
        for (key, value) in &step.env {
            hasher.update(key.as_bytes());
            hasher.update(render_template(value, &entry.values).as_bytes());
        }
        if let Some(condition) = &step.condition {
            hasher.update(condition.interpreter.clone().unwrap_or_default().as_bytes());
            hasher.update(condition.trigger_ref.clone().unwrap_or_default().as_bytes());
        }
        hasher.update([if step.always_run { 1u8 } else { 0u8 }]);
    }
    for (key, value) in &entry.env {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    if let Some(base_image) = &entry.base_image {
        hasher.update(base_image.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StepSpec;
    use crate::matrix::MatrixSpec;
    use indexmap::indexmap;
    use tempfile::tempdir;

    fn workflow() -> Workflow {
        Workflow {
            version: 1,
            trigger: None,
            matrix: MatrixSpec {
                dimensions: indexmap! {
                    "os".to_string() => vec!["linux".to_string(), "macos".to_string()],
                    "interpreter".to_string() => vec!["cp312".to_string()],
                },
                include: Vec::new(),
                exclude: Vec::new(),
            },
            steps: vec![StepSpec {
                name: "build".to_string(),
                run: vec!["echo".to_string(), "{os}".to_string()],
                env: BTreeMap::new(),
                condition: None,
                always_run: false,
            }],
            artifacts: Vec::new(),
            release: None,
        }
    }

    #[test]
    fn manifest_written_with_one_job_per_entry() {
        let workflow = workflow();
        let entries = workflow.matrix.expand().unwrap();
        let temp = tempdir().unwrap();
        let path = temp.path().join("run-manifest.yaml");

        generate_manifest(&workflow, &entries, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("workflow_version: 1"));
        assert!(content.contains("linux-cp312"));
        assert!(content.contains("macos-cp312"));
        assert!(content.contains("steps_hash"));
    }

    #[test]
    fn hashes_are_stable_and_entry_sensitive() {
        let workflow = workflow();
        let entries = workflow.matrix.expand().unwrap();

        let first = hash_steps(&workflow, &entries[0]);
        let again = hash_steps(&workflow, &entries[0]);
        let other = hash_steps(&workflow, &entries[1]);

        assert_eq!(first, again);
        assert_ne!(first, other, "rendered argv differs per entry");
    }
}
