use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declarative build matrix: named dimensions crossed into independent job
/// entries, with exclude filters and include overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Dimension name -> declared values, in declaration order.
    pub dimensions: IndexMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<IncludeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<BTreeMap<String, String>>,
}

/// Override applied to every expanded entry matching `selector`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeSpec {
    #[serde(rename = "match")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("matrix declares no dimensions")]
    EmptyMatrix,
    #[error("dimension '{0}' declares no values")]
    EmptyDimension(String),
    #[error("dimension '{dimension}' declares duplicate value '{value}'")]
    DuplicateValue { dimension: String, value: String },
    #[error("include selector references unknown dimension '{0}'")]
    UnknownIncludeDimension(String),
    #[error("include selector references value '{value}' not declared for dimension '{dimension}'")]
    UnknownIncludeValue { dimension: String, value: String },
    #[error("exclude filter references unknown dimension '{0}'")]
    UnknownExcludeDimension(String),
    #[error("dimension values collide into the same job id '{0}'")]
    DuplicateJobId(String),
}

/// One expanded build job target. Immutable once produced by
/// [`MatrixSpec::expand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
    /// Stable identifier derived from the dimension values.
    pub job_id: String,
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl MatrixEntry {
    pub fn value(&self, dimension: &str) -> Option<&str> {
        self.values.get(dimension).map(String::as_str)
    }

    /// Conventional `os` dimension, if declared.
    pub fn os(&self) -> Option<&str> {
        self.value("os")
    }

    /// Conventional `interpreter` dimension, if declared.
    pub fn interpreter(&self) -> Option<&str> {
        self.value("interpreter")
    }
}

impl MatrixSpec {
    /// Expand the cross-product of dimensions in declaration order, dropping
    /// excluded combinations and applying include overrides. Pure: no side
    /// effects, and the result never contains duplicate entries.
    pub fn expand(&self) -> Result<Vec<MatrixEntry>, ConfigurationError> {
        self.check()?;

        let names: Vec<&String> = self.dimensions.keys().collect();
        let mut entries = Vec::new();
        let mut indices = vec![0usize; names.len()];

        'product: loop {
            let mut values = BTreeMap::new();
            for (dim_idx, name) in names.iter().enumerate() {
                let declared = &self.dimensions[*name];
                values.insert((*name).clone(), declared[indices[dim_idx]].clone());
            }

            if !self.exclude.iter().any(|filter| subset_matches(filter, &values)) {
                let mut entry = MatrixEntry {
                    job_id: job_id_for(&names, &values),
                    values,
                    base_image: None,
                    env: BTreeMap::new(),
                };
                for include in &self.include {
                    if subset_matches(&include.selector, &entry.values) {
                        if include.base_image.is_some() {
                            entry.base_image = include.base_image.clone();
                        }
                        for (key, value) in &include.env {
                            entry.env.insert(key.clone(), value.clone());
                        }
                    }
                }
                entries.push(entry);
            }

            // Odometer increment over dimension indices, last dimension fastest.
            let mut position = names.len();
            loop {
                if position == 0 {
                    break 'product;
                }
                position -= 1;
                indices[position] += 1;
                if indices[position] < self.dimensions[names[position]].len() {
                    break;
                }
                indices[position] = 0;
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for entry in &entries {
            if !seen.insert(entry.job_id.as_str()) {
                return Err(ConfigurationError::DuplicateJobId(entry.job_id.clone()));
            }
        }
        Ok(entries)
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        if self.dimensions.is_empty() {
            return Err(ConfigurationError::EmptyMatrix);
        }
        for (name, values) in &self.dimensions {
            if values.is_empty() {
                return Err(ConfigurationError::EmptyDimension(name.clone()));
            }
            let mut seen = Vec::with_capacity(values.len());
            for value in values {
                if seen.contains(&value) {
                    return Err(ConfigurationError::DuplicateValue {
                        dimension: name.clone(),
                        value: value.clone(),
                    });
                }
                seen.push(value);
            }
        }
        for include in &self.include {
            for (dimension, value) in &include.selector {
                let Some(declared) = self.dimensions.get(dimension) else {
                    return Err(ConfigurationError::UnknownIncludeDimension(dimension.clone()));
                };
                if !declared.contains(value) {
                    return Err(ConfigurationError::UnknownIncludeValue {
                        dimension: dimension.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        for filter in &self.exclude {
            for dimension in filter.keys() {
                if !self.dimensions.contains_key(dimension) {
                    return Err(ConfigurationError::UnknownExcludeDimension(dimension.clone()));
                }
            }
        }
        Ok(())
    }
}

fn subset_matches(filter: &BTreeMap<String, String>, values: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(key, value)| values.get(key) == Some(value))
}

fn job_id_for(names: &[&String], values: &BTreeMap<String, String>) -> String {
    let parts: Vec<String> = names
        .iter()
        .map(|name| slug(values.get(*name).map(String::as_str).unwrap_or_default()))
        .collect();
    parts.join("-")
}

fn slug(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn two_by_three() -> MatrixSpec {
        MatrixSpec {
            dimensions: indexmap! {
                "os".to_string() => vec!["linux".to_string(), "macos".to_string()],
                "interpreter".to_string() => vec![
                    "cp310".to_string(),
                    "cp311".to_string(),
                    "cp312".to_string(),
                ],
            },
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    #[test]
    fn expansion_size_is_product_of_cardinalities() {
        let entries = two_by_three().expand().unwrap();
        assert_eq!(entries.len(), 6);

        let mut ids: Vec<&str> = entries.iter().map(|e| e.job_id.as_str()).collect();
        let unique_before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), unique_before, "expanded entries must be unique");
    }

    #[test]
    fn expansion_preserves_declaration_order() {
        let entries = two_by_three().expand().unwrap();
        assert_eq!(entries[0].job_id, "linux-cp310");
        assert_eq!(entries[1].job_id, "linux-cp311");
        assert_eq!(entries[5].job_id, "macos-cp312");
    }

    #[test]
    fn exclude_filters_matching_combinations() {
        let mut spec = two_by_three();
        let mut filter = BTreeMap::new();
        filter.insert("os".to_string(), "macos".to_string());
        filter.insert("interpreter".to_string(), "cp310".to_string());
        spec.exclude.push(filter);

        let entries = spec.expand().unwrap();
        assert_eq!(entries.len(), 5);
        assert!(!entries.iter().any(|e| e.job_id == "macos-cp310"));
    }

    #[test]
    fn include_overrides_matching_entries() {
        let mut spec = two_by_three();
        let mut selector = BTreeMap::new();
        selector.insert("os".to_string(), "linux".to_string());
        let mut env = BTreeMap::new();
        env.insert("CFLAGS".to_string(), "-O2".to_string());
        spec.include.push(IncludeSpec {
            selector,
            base_image: Some("manylinux2014".to_string()),
            env,
        });

        let entries = spec.expand().unwrap();
        let linux: Vec<_> = entries.iter().filter(|e| e.os() == Some("linux")).collect();
        assert_eq!(linux.len(), 3);
        for entry in linux {
            assert_eq!(entry.base_image.as_deref(), Some("manylinux2014"));
            assert_eq!(entry.env.get("CFLAGS").map(String::as_str), Some("-O2"));
        }
        for entry in entries.iter().filter(|e| e.os() == Some("macos")) {
            assert!(entry.base_image.is_none());
            assert!(entry.env.is_empty());
        }
    }

    #[test]
    fn include_with_unknown_dimension_is_rejected() {
        let mut spec = two_by_three();
        let mut selector = BTreeMap::new();
        selector.insert("architecture".to_string(), "arm64".to_string());
        spec.include.push(IncludeSpec {
            selector,
            base_image: None,
            env: BTreeMap::new(),
        });

        let err = spec.expand().unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownIncludeDimension(d) if d == "architecture"));
    }

    #[test]
    fn include_with_undeclared_value_is_rejected() {
        let mut spec = two_by_three();
        let mut selector = BTreeMap::new();
        selector.insert("os".to_string(), "freebsd".to_string());
        spec.include.push(IncludeSpec {
            selector,
            base_image: None,
            env: BTreeMap::new(),
        });

        let err = spec.expand().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnknownIncludeValue { dimension, value }
                if dimension == "os" && value == "freebsd"
        ));
    }

    #[test]
    fn colliding_job_ids_are_rejected() {
        let spec = MatrixSpec {
            dimensions: indexmap! {
                "os".to_string() => vec!["linux x64".to_string(), "linux_x64".to_string()],
            },
            include: Vec::new(),
            exclude: Vec::new(),
        };
        assert!(matches!(
            spec.expand().unwrap_err(),
            ConfigurationError::DuplicateJobId(id) if id == "linux_x64"
        ));
    }

    #[test]
    fn empty_dimension_is_rejected() {
        let spec = MatrixSpec {
            dimensions: indexmap! {
                "os".to_string() => Vec::new(),
            },
            include: Vec::new(),
            exclude: Vec::new(),
        };
        assert!(matches!(
            spec.expand().unwrap_err(),
            ConfigurationError::EmptyDimension(d) if d == "os"
        ));
    }
}
