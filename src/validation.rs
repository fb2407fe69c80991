use serde::Serialize;

use crate::workflow::Workflow;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks over a workflow, run before any job starts. Matrix
/// expansion errors are configuration errors and surface here as well.
pub fn validate_workflow(workflow: &Workflow) -> ValidationReport {
    let mut report = ValidationReport::default();

    if workflow.version != 1 {
        report
            .errors
            .push(format!("Unsupported workflow version: {}", workflow.version));
    }

    match workflow.matrix.expand() {
        Ok(entries) => {
            if entries.is_empty() {
                report
                    .warnings
                    .push("Matrix expands to zero entries; nothing will build".into());
            }
        }
        Err(err) => report.errors.push(err.to_string()),
    }

    if workflow.steps.is_empty() {
        report
            .errors
            .push("Workflow must contain at least one step".into());
    }
    for (idx, step) in workflow.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            report
                .errors
                .push(format!("Step {} has an empty name", idx + 1));
        }
        if step.run.is_empty() || step.run[0].trim().is_empty() {
            report.errors.push(format!(
                "Step {} ('{}') has an empty command",
                idx + 1,
                step.name
            ));
        }
        if let Some(condition) = &step.condition {
            for (label, pattern) in [
                ("interpreter", &condition.interpreter),
                ("trigger_ref", &condition.trigger_ref),
            ] {
                if let Some(pattern) = pattern
                    && let Err(err) = glob::Pattern::new(pattern)
                {
                    report.errors.push(format!(
                        "Step {} ('{}') has an invalid {} condition '{}': {}",
                        idx + 1,
                        step.name,
                        label,
                        pattern,
                        err
                    ));
                }
            }
        }
    }

    for (idx, pattern) in workflow.artifacts.iter().enumerate() {
        if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "Artifact pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                pattern,
                err
            ));
        }
    }
    if workflow.artifacts.is_empty() && !workflow.steps.iter().any(|s| s.always_run) {
        report
            .warnings
            .push("No artifact patterns and no always-run collection step configured".into());
    }

    if let Some(trigger) = &workflow.trigger {
        if trigger.tags.is_empty() {
            report
                .errors
                .push("Trigger declares no tag patterns".into());
        }
        for pattern in &trigger.tags {
            if let Err(err) = glob::Pattern::new(pattern) {
                report.errors.push(format!(
                    "Trigger tag pattern '{}' is not a valid glob: {}",
                    pattern, err
                ));
            }
        }
        match &workflow.release {
            Some(release) => {
                for (label, argv) in [
                    ("sdist", &release.sdist),
                    ("upload", &release.upload),
                    ("create_release", &release.create_release),
                ] {
                    if argv.is_empty() || argv[0].trim().is_empty() {
                        report
                            .errors
                            .push(format!("Release '{label}' command is empty"));
                    }
                }
            }
            None => {
                report
                    .errors
                    .push("Trigger is declared but the workflow has no release section".into());
            }
        }
    } else if workflow.release.is_some() {
        report
            .warnings
            .push("Release section is declared without a trigger; publish will never arm".into());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StepSpec;
    use crate::matrix::MatrixSpec;
    use indexmap::indexmap;
    use std::collections::BTreeMap;

    fn base_workflow() -> Workflow {
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
                run: vec!["true".to_string()],
                env: BTreeMap::new(),
                condition: None,
                always_run: false,
            }],
            artifacts: vec!["wheelhouse/*.whl".to_string()],
            release: None,
        }
    }

    #[test]
    fn valid_workflow_passes() {
        let report = validate_workflow(&base_workflow());
        assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn empty_step_command_is_an_error() {
        let mut workflow = base_workflow();
        workflow.steps[0].run.clear();
        let report = validate_workflow(&workflow);
        assert!(!report.is_ok());
    }

    #[test]
    fn trigger_without_release_is_an_error() {
        let mut workflow = base_workflow();
        workflow.trigger = Some(crate::workflow::TriggerSpec {
            tags: vec!["v*".to_string()],
            repository_owner: None,
        });
        let report = validate_workflow(&workflow);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("no release section")));
    }

    #[test]
    fn matrix_configuration_errors_surface() {
        let mut workflow = base_workflow();
        let mut selector = BTreeMap::new();
        selector.insert("arch".to_string(), "arm64".to_string());
        workflow.matrix.include.push(crate::matrix::IncludeSpec {
            selector,
            base_image: None,
            env: BTreeMap::new(),
        });
        let report = validate_workflow(&workflow);
        assert!(report.errors.iter().any(|e| e.contains("unknown dimension")));
    }

    #[test]
    fn missing_collection_config_is_a_warning() {
        let mut workflow = base_workflow();
        workflow.artifacts.clear();
        let report = validate_workflow(&workflow);
        assert!(report.is_ok());
        assert!(!report.warnings.is_empty());
    }
}
