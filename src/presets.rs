use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::indexmap;

use crate::job::{StepCondition, StepSpec};
use crate::matrix::{IncludeSpec, MatrixSpec};
use crate::workflow::{ReleaseSpec, TriggerSpec, Workflow};

/// Write a starter workflow for `name` to `destination`.
pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let workflow = match name {
        "wheels" => wheels_preset(),
        "minimal" => minimal_preset(),
        other => anyhow::bail!("Unknown preset '{other}'. Available presets: minimal, wheels"),
    };

    let rendered = serde_yaml::to_string(&workflow)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset workflow: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn wheels_preset() -> Workflow {
    let mut legacy_env = BTreeMap::new();
    legacy_env.insert("CIBW_BUILD".to_string(), "{interpreter}-*".to_string());

    Workflow {
        version: 1,
        trigger: Some(TriggerSpec {
            tags: vec!["v*".to_string(), "buildwheels*".to_string()],
            repository_owner: Some("acme".to_string()),
        }),
        matrix: MatrixSpec {
            dimensions: indexmap! {
                "os".to_string() => vec![
                    "linux".to_string(),
                    "macos".to_string(),
                    "windows".to_string(),
                ],
                "interpreter".to_string() => vec![
                    "cp310".to_string(),
                    "cp311".to_string(),
                    "cp312".to_string(),
                ],
            },
            include: vec![IncludeSpec {
                selector: BTreeMap::from([("os".to_string(), "linux".to_string())]),
                base_image: Some("manylinux2014".to_string()),
                env: BTreeMap::new(),
            }],
            exclude: vec![BTreeMap::from([
                ("os".to_string(), "windows".to_string()),
                ("interpreter".to_string(), "cp310".to_string()),
            ])],
        },
        steps: vec![
            StepSpec {
                name: "checkout".to_string(),
                run: vec![
                    "git".to_string(),
                    "clone".to_string(),
                    "--depth=1".to_string(),
                    "https://example.invalid/acme/pkg.git".to_string(),
                    ".".to_string(),
                ],
                env: BTreeMap::new(),
                condition: None,
                always_run: false,
            },
            StepSpec {
                name: "build-wheels".to_string(),
                run: vec!["cibuildwheel".to_string(), "--output-dir".to_string(), "wheelhouse".to_string()],
                env: legacy_env,
                condition: None,
                always_run: false,
            },
            StepSpec {
                name: "legacy-build".to_string(),
                run: vec!["cibuildwheel".to_string(), "--output-dir".to_string(), "wheelhouse".to_string()],
                env: BTreeMap::new(),
                condition: Some(StepCondition {
                    interpreter: Some("cp310".to_string()),
                    trigger_ref: Some("refs/tags/buildwheels*".to_string()),
                }),
                always_run: false,
            },
        ],
        artifacts: vec!["wheelhouse/*.whl".to_string()],
        release: Some(ReleaseSpec {
            tag_prefix: "v".to_string(),
            sdist: vec![
                "python".to_string(),
                "-m".to_string(),
                "build".to_string(),
                "--sdist".to_string(),
                "--outdir".to_string(),
                "{dest}".to_string(),
            ],
            upload: vec!["twine".to_string(), "upload".to_string(), "{artifact}".to_string()],
            create_release: vec![
                "gh".to_string(),
                "release".to_string(),
                "create".to_string(),
                "{tag}".to_string(),
                "--notes-file".to_string(),
                "{changelog}".to_string(),
            ],
            changelog: Some(PathBuf::from("CHANGELOG.md")),
        }),
    }
}

fn minimal_preset() -> Workflow {
    Workflow {
        version: 1,
        trigger: None,
        matrix: MatrixSpec {
            dimensions: indexmap! {
                "os".to_string() => vec!["linux".to_string()],
                "interpreter".to_string() => vec!["cp312".to_string()],
            },
            include: Vec::new(),
            exclude: Vec::new(),
        },
        steps: vec![StepSpec {
            name: "build".to_string(),
            run: vec!["echo".to_string(), "building {interpreter} on {os}".to_string()],
            env: BTreeMap::new(),
            condition: None,
            always_run: false,
        }],
        artifacts: vec!["dist/*.whl".to_string()],
        release: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_workflow;
    use tempfile::tempdir;

    #[test]
    fn presets_round_trip_and_validate() {
        let temp = tempdir().unwrap();
        for name in ["minimal", "wheels"] {
            let path = temp.path().join(format!("{name}.yaml"));
            generate_preset(name, &path).unwrap();

            let workflow = Workflow::load(&path).unwrap();
            let report = validate_workflow(&workflow);
            assert!(
                report.is_ok(),
                "preset '{name}' fails validation: {:?}",
                report.errors
            );
        }
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let temp = tempdir().unwrap();
        assert!(generate_preset("nightly", &temp.path().join("x.yaml")).is_err());
    }
}
