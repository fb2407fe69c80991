use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::aggregate::AggregateGate;
use crate::observability::MetricsCollector;
use crate::workflow::{ReleaseSpec, TriggerSpec, render_template, tag_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherState {
    Waiting,
    Gated,
    Building,
    Uploading,
    Released,
    Failed,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("package index rejected '{artifact}': {reason}")]
    Rejected { artifact: String, reason: String },
    #[error("failed to invoke uploader: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release record creation failed: {0}")]
    Create(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher is in state {0:?}, expected Gated")]
    InvalidState(PublisherState),
    #[error("trigger ref '{0}' is not a tag")]
    NotATag(String),
    #[error("release gate failed: {failed} of {expected} jobs did not succeed")]
    GateFailed { failed: usize, expected: usize },
    #[error("source distribution build failed: {0}")]
    SdistBuild(String),
    #[error("no source distribution found in {0}")]
    MissingSdist(PathBuf),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Release(#[from] ReleaseError),
}

/// Uploads one artifact to the package index. Credentials are the client's
/// concern (supplied out-of-band, e.g. via the uploader's environment).
pub trait IndexClient {
    fn upload(&self, artifact: &Path) -> Result<(), UploadError>;
}

/// Creates the tagged release record and returns its URL.
pub trait ReleaseApi {
    fn create(&self, tag: &str, changelog: Option<&Path>) -> Result<String, ReleaseError>;
}

/// Index client shelling out to the configured uploader command, with
/// `{artifact}` substituted per file.
pub struct CommandIndexClient {
    argv: Vec<String>,
}

impl CommandIndexClient {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl IndexClient for CommandIndexClient {
    fn upload(&self, artifact: &Path) -> Result<(), UploadError> {
        let mut bindings = BTreeMap::new();
        bindings.insert(
            "artifact".to_string(),
            artifact.to_string_lossy().to_string(),
        );
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|arg| render_template(arg, &bindings))
            .collect();
        let output = run_command(&argv).map_err(UploadError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(UploadError::Rejected {
                artifact: artifact.display().to_string(),
                reason: failure_reason(&output),
            })
        }
    }
}

/// Release API shelling out to the configured release record command, with
/// `{tag}` and `{changelog}` substituted.
pub struct CommandReleaseApi {
    argv: Vec<String>,
}

impl CommandReleaseApi {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl ReleaseApi for CommandReleaseApi {
    fn create(&self, tag: &str, changelog: Option<&Path>) -> Result<String, ReleaseError> {
        let mut bindings = BTreeMap::new();
        bindings.insert("tag".to_string(), tag.to_string());
        bindings.insert(
            "changelog".to_string(),
            changelog.map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
        );
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|arg| render_template(arg, &bindings))
            .collect();
        let output = run_command(&argv).map_err(ReleaseError::Create)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ReleaseError::Create(failure_reason(&output)))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseOutcome {
    pub tag: String,
    pub version: String,
    /// Uploaded file names, wheels strictly before the sdist.
    pub uploaded: Vec<String>,
    pub release_url: String,
}

/// Release state machine: `Waiting -> Gated -> Building -> Uploading ->
/// Released`, with any failure terminal in `Failed`. There is no automatic
/// retry; the operator re-pushes the tag or reruns the publish.
pub struct ReleasePublisher {
    spec: ReleaseSpec,
    state: PublisherState,
}

impl ReleasePublisher {
    pub fn new(spec: ReleaseSpec) -> Self {
        Self {
            spec,
            state: PublisherState::Waiting,
        }
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    /// `Waiting -> Gated` when the trigger ref matches a tag pattern and the
    /// owner gate passes. Returns false (and stays Waiting) otherwise.
    pub fn arm(&mut self, trigger: &TriggerSpec, trigger_ref: &str, owner: Option<&str>) -> bool {
        if self.state != PublisherState::Waiting {
            return false;
        }
        if trigger.matches_ref(trigger_ref) && trigger.matches_owner(owner) {
            self.state = PublisherState::Gated;
            true
        } else {
            false
        }
    }

    /// Drive `Gated` through to `Released`: check the all-success gate,
    /// build the sdist into `staging`, upload wheels (sorted) strictly
    /// before the sdist, then create the release record.
    pub fn publish(
        &mut self,
        trigger_ref: &str,
        gate: &AggregateGate,
        index: &dyn IndexClient,
        api: &dyn ReleaseApi,
        staging: &Path,
        metrics: &MetricsCollector,
    ) -> Result<ReleaseOutcome, PublishError> {
        if self.state != PublisherState::Gated {
            return Err(PublishError::InvalidState(self.state));
        }

        if !gate.all_success {
            self.state = PublisherState::Failed;
            return Err(PublishError::GateFailed {
                failed: gate.failed_count(),
                expected: gate.expected,
            });
        }

        self.state = PublisherState::Building;
        let tag = match tag_name(trigger_ref) {
            Some(tag) => tag.to_string(),
            None => {
                self.state = PublisherState::Failed;
                return Err(PublishError::NotATag(trigger_ref.to_string()));
            }
        };
        let version = tag
            .strip_prefix(&self.spec.tag_prefix)
            .unwrap_or(&tag)
            .to_string();
        info!(tag = tag.as_str(), version = version.as_str(), "Building source distribution");

        let sdist = match self.build_sdist(&version, staging) {
            Ok(sdist) => sdist,
            Err(err) => {
                self.state = PublisherState::Failed;
                return Err(err);
            }
        };

        self.state = PublisherState::Uploading;
        let mut wheels: Vec<&Path> = gate.wheels();
        wheels.sort();

        let mut uploaded = Vec::with_capacity(wheels.len() + 1);
        // Wheels go first so index users never fall back to a from-source
        // build while prebuilt artifacts are still missing.
        for wheel in wheels {
            if let Err(err) = index.upload(wheel) {
                self.state = PublisherState::Failed;
                return Err(err.into());
            }
            metrics.record_upload();
            uploaded.push(file_name(wheel));
            info!(artifact = %wheel.display(), "Uploaded wheel");
        }
        if let Err(err) = index.upload(&sdist) {
            self.state = PublisherState::Failed;
            return Err(err.into());
        }
        metrics.record_upload();
        uploaded.push(file_name(&sdist));
        info!(artifact = %sdist.display(), "Uploaded source distribution");

        let release_url = match api.create(&tag, self.spec.changelog.as_deref()) {
            Ok(url) => url,
            Err(err) => {
                self.state = PublisherState::Failed;
                return Err(err.into());
            }
        };

        self.state = PublisherState::Released;
        info!(tag = tag.as_str(), url = release_url.as_str(), "Release created");
        Ok(ReleaseOutcome {
            tag,
            version,
            uploaded,
            release_url,
        })
    }

    fn build_sdist(&self, version: &str, staging: &Path) -> Result<PathBuf, PublishError> {
        std::fs::create_dir_all(staging)
            .map_err(|err| PublishError::SdistBuild(err.to_string()))?;

        let mut bindings = BTreeMap::new();
        bindings.insert("version".to_string(), version.to_string());
        bindings.insert("dest".to_string(), staging.to_string_lossy().to_string());
        let argv: Vec<String> = self
            .spec
            .sdist
            .iter()
            .map(|arg| render_template(arg, &bindings))
            .collect();

        let output = run_command(&argv).map_err(PublishError::SdistBuild)?;
        if !output.status.success() {
            return Err(PublishError::SdistBuild(failure_reason(&output)));
        }

        find_sdist(staging).ok_or_else(|| PublishError::MissingSdist(staging.to_path_buf()))
    }
}

fn find_sdist(staging: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(staging)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".tar.gz") || n.ends_with(".zip"))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn run_command(argv: &[String]) -> Result<std::process::Output, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;
    Command::new(program)
        .args(args)
        .output()
        .map_err(|err| format!("failed to spawn '{program}': {err}"))
}

fn failure_reason(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("exited with {:?}", output.status.code())
    } else {
        trimmed.to_string()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
