//! Workflow configuration (`.civic/workflows.yml`).
//!
//! Statuses and the transition graph are global, optionally overridden per
//! record type. An override *replaces* the global lists for that type, it
//! does not merge.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Permissions of one role.
///
/// `None` for an action list means the action is denied everywhere
/// (deny-by-default); an empty list is an explicit total denial too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolePermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_create: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_edit: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_delete: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_view: Option<Vec<String>>,
    /// `from-status -> [to-status...]`; key `any` is a wildcard source.
    #[serde(default)]
    pub can_transition: HashMap<String, Vec<String>>,
}

/// Per-record-type replacement of statuses and transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitions: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub statuses: Vec<String>,
    #[serde(default)]
    pub transitions: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub roles: HashMap<String, RolePermissions>,
    #[serde(default, rename = "recordTypes")]
    pub record_types: HashMap<String, TypeOverride>,
}

impl WorkflowConfig {
    /// Loads and validates `workflows.yml`; falls back to the default civic
    /// workflow when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.is_file() {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&raw)?
        } else {
            Self::default_civic()
        };
        config.validate()?;
        Ok(config)
    }

    /// Every status named in transition keys and targets must exist in the
    /// status set, globally and per override.
    pub fn validate(&self) -> Result<()> {
        Self::check_graph(&self.statuses, &self.transitions)?;
        for (record_type, over) in &self.record_types {
            let statuses = over.statuses.as_ref().unwrap_or(&self.statuses);
            let transitions = over.transitions.as_ref().unwrap_or(&self.transitions);
            Self::check_graph(statuses, transitions).map_err(|e| {
                Error::InvalidInput(format!("recordTypes.{record_type}: {e}"))
            })?;
        }
        Ok(())
    }

    fn check_graph(statuses: &[String], transitions: &HashMap<String, Vec<String>>) -> Result<()> {
        for (from, targets) in transitions {
            if !statuses.iter().any(|s| s == from) {
                return Err(Error::UnknownStatus(from.clone()));
            }
            for to in targets {
                if !statuses.iter().any(|s| s == to) {
                    return Err(Error::UnknownStatus(to.clone()));
                }
            }
        }
        Ok(())
    }

    /// Status set for a type, honoring overrides.
    pub fn statuses_for(&self, record_type: &str) -> &[String] {
        self.record_types
            .get(record_type)
            .and_then(|o| o.statuses.as_deref())
            .unwrap_or(&self.statuses)
    }

    /// Transition graph for a type, honoring overrides (replace, not merge).
    pub fn transitions_for(&self, record_type: &str) -> &HashMap<String, Vec<String>> {
        self.record_types
            .get(record_type)
            .and_then(|o| o.transitions.as_ref())
            .unwrap_or(&self.transitions)
    }

    /// The default civic workflow: draft → proposed → approved → archived,
    /// clerks propose, council approves and archives.
    pub fn default_civic() -> Self {
        let statuses: Vec<String> = ["draft", "proposed", "approved", "archived"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        let transitions: HashMap<String, Vec<String>> = [
            ("draft", vec!["proposed"]),
            ("proposed", vec!["approved", "draft"]),
            ("approved", vec!["archived"]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
        .collect();

        let mut roles = HashMap::new();
        roles.insert(
            "clerk".to_string(),
            RolePermissions {
                can_create: Some(vec!["*".to_string()]),
                can_edit: Some(vec!["*".to_string()]),
                can_delete: None,
                can_view: Some(vec!["*".to_string()]),
                can_transition: [
                    ("draft".to_string(), vec!["proposed".to_string()]),
                    ("proposed".to_string(), vec!["draft".to_string()]),
                ]
                .into_iter()
                .collect(),
            },
        );
        roles.insert(
            "council".to_string(),
            RolePermissions {
                can_create: Some(vec!["motion".to_string(), "resolution".to_string()]),
                can_edit: Some(vec!["*".to_string()]),
                can_delete: Some(vec!["*".to_string()]),
                can_view: Some(vec!["*".to_string()]),
                can_transition: [
                    (
                        "proposed".to_string(),
                        vec!["approved".to_string(), "draft".to_string()],
                    ),
                    ("approved".to_string(), vec!["archived".to_string()]),
                ]
                .into_iter()
                .collect(),
            },
        );
        roles.insert(
            "public".to_string(),
            RolePermissions {
                can_view: Some(vec!["*".to_string()]),
                ..Default::default()
            },
        );

        WorkflowConfig {
            statuses,
            transitions,
            roles,
            record_types: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_default_is_valid() {
        WorkflowConfig::default_civic().validate().unwrap();
    }

    #[test]
    fn test_unknown_status_in_transitions_rejected() {
        let raw = "statuses: [draft]\ntransitions:\n  draft: [published]\n";
        let config: WorkflowConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let raw = r#"
statuses: [draft, approved]
transitions:
  draft: [approved]
roles:
  clerk:
    can_create: ["bylaw"]
    can_transition:
      draft: [approved]
recordTypes:
  feedback:
    statuses: [open, closed]
    transitions:
      open: [closed]
"#;
        let config: WorkflowConfig = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.statuses_for("feedback"), ["open", "closed"]);
        assert_eq!(config.statuses_for("bylaw"), ["draft", "approved"]);
    }
}
