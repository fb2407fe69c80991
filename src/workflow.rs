use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::job::StepSpec;
use crate::matrix::MatrixSpec;

/// Declarative build-and-release workflow, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
    pub matrix: MatrixSpec,
    pub steps: Vec<StepSpec>,
    /// Glob patterns (relative to the job workspace) collected into the
    /// artifact store after the step sequence, regardless of job outcome.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseSpec>,
}

impl Workflow {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
        let workflow: Workflow = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse workflow YAML: {}", path.display()))?;
        Ok(workflow)
    }
}

/// Tag-push trigger gate for the release phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Tag glob patterns, matched against the tag name (e.g. `v*`).
    pub tags: Vec<String>,
    /// When set, releases only run for this repository owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_owner: Option<String>,
}

impl TriggerSpec {
    /// Whether `trigger_ref` is a tag push matching one of the tag patterns.
    pub fn matches_ref(&self, trigger_ref: &str) -> bool {
        let Some(tag) = tag_name(trigger_ref) else {
            return false;
        };
        self.tags.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(tag))
                .unwrap_or(false)
        })
    }

    /// Whether the owner gate passes for `owner` (always true if no owner
    /// is configured).
    pub fn matches_owner(&self, owner: Option<&str>) -> bool {
        match &self.repository_owner {
            Some(expected) => owner == Some(expected.as_str()),
            None => true,
        }
    }
}

/// Release procedure: sdist build, artifact upload, and release record
/// commands, each an argv template rendered per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSpec {
    /// Prefix stripped from the tag name to derive the version string.
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Command building the source distribution; `{version}` and `{dest}`
    /// placeholders are substituted.
    pub sdist: Vec<String>,
    /// Uploader command; `{artifact}` is substituted per file.
    pub upload: Vec<String>,
    /// Release record command; `{tag}` and `{changelog}` are substituted.
    pub create_release: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<PathBuf>,
}

fn default_tag_prefix() -> String {
    "v".to_string()
}

/// Extract the tag name from a ref like `refs/tags/v1.2.3`. A bare tag name
/// is accepted as-is; branch refs yield `None`.
pub fn tag_name(trigger_ref: &str) -> Option<&str> {
    if let Some(tag) = trigger_ref.strip_prefix("refs/tags/") {
        (!tag.is_empty()).then_some(tag)
    } else if trigger_ref.starts_with("refs/") {
        None
    } else {
        (!trigger_ref.is_empty()).then_some(trigger_ref)
    }
}

/// Render `{key}` placeholders in a template from entry values and extra
/// bindings. Unknown placeholders are left untouched.
pub fn render_template(template: &str, bindings: &BTreeMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in bindings {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_name_strips_refs_prefix() {
        assert_eq!(tag_name("refs/tags/v1.2.3"), Some("v1.2.3"));
        assert_eq!(tag_name("v1.2.3"), Some("v1.2.3"));
        assert_eq!(tag_name("refs/heads/main"), None);
        assert_eq!(tag_name("refs/tags/"), None);
    }

    #[test]
    fn trigger_matches_tag_patterns() {
        let trigger = TriggerSpec {
            tags: vec!["v*".to_string(), "buildwheels*".to_string()],
            repository_owner: None,
        };
        assert!(trigger.matches_ref("refs/tags/v1.2.3"));
        assert!(trigger.matches_ref("refs/tags/buildwheels-2024"));
        assert!(!trigger.matches_ref("refs/tags/nightly"));
        assert!(!trigger.matches_ref("refs/heads/v1.2.3"));
    }

    #[test]
    fn owner_gate_requires_exact_match() {
        let trigger = TriggerSpec {
            tags: vec!["v*".to_string()],
            repository_owner: Some("acme".to_string()),
        };
        assert!(trigger.matches_owner(Some("acme")));
        assert!(!trigger.matches_owner(Some("fork-owner")));
        assert!(!trigger.matches_owner(None));

        let open = TriggerSpec {
            tags: vec!["v*".to_string()],
            repository_owner: None,
        };
        assert!(open.matches_owner(None));
    }

    #[test]
    fn render_template_substitutes_bindings() {
        let mut bindings = BTreeMap::new();
        bindings.insert("os".to_string(), "linux".to_string());
        bindings.insert("interpreter".to_string(), "cp312".to_string());
        assert_eq!(
            render_template("{interpreter}-manylinux_{os}", &bindings),
            "cp312-manylinux_linux"
        );
        assert_eq!(render_template("{unknown}", &bindings), "{unknown}");
    }
}
