//! Role bindings and definitions (`.civic/roles.yml`).
//!
//! Maps usernames to roles and describes each role for operators. The
//! workflow engine consumes only the role name; the richer definition
//! fields (`approval_required`, `can_publish`, `can_merge`) are surfaced to
//! callers that render role information.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub can_publish: bool,
    #[serde(default)]
    pub can_merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBinding {
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Per-user overrides of the role's default permission strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub metadata: serde_yaml::Mapping,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolesConfig {
    #[serde(default)]
    pub users: HashMap<String, UserBinding>,
    #[serde(default)]
    pub roles: HashMap<String, RoleDefinition>,
}

impl RolesConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// The role bound to a username; inactive bindings resolve to `public`.
    pub fn role_of(&self, username: &str) -> &str {
        match self.users.get(username) {
            Some(binding) if binding.active => &binding.role,
            _ => "public",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_role_of() {
        let raw = r#"
users:
  clerk-ada:
    role: clerk
    name: Ada
  retired-bob:
    role: council
    active: false
roles:
  clerk:
    description: Records clerk
    can_publish: false
"#;
        let config: RolesConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.role_of("clerk-ada"), "clerk");
        assert_eq!(config.role_of("retired-bob"), "public");
        assert_eq!(config.role_of("nobody"), "public");
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = RolesConfig::default();
        assert_eq!(config.role_of("anyone"), "public");
    }
}
