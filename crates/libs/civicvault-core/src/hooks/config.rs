//! Hook enablement (`.civic/hooks.yml`).
//!
//! Events are enabled by default; the file lists exceptions and may disable
//! the bus wholesale. Subscriber *bindings* (which workflow runs for which
//! event) live in the same file but are opaque to the core; the runner
//! collaborator consumes them.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-event overrides; absent means enabled.
    #[serde(default)]
    pub events: HashMap<String, bool>,
    /// Opaque subscriber bindings for the external runner.
    #[serde(default)]
    pub bindings: HashMap<String, Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl Default for HooksConfig {
    fn default() -> Self {
        HooksConfig {
            enabled: true,
            events: HashMap::new(),
            bindings: HashMap::new(),
        }
    }
}

impl HooksConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn is_enabled(&self, event_name: &str) -> bool {
        self.enabled && *self.events.get(event_name).unwrap_or(&true)
    }

    pub fn set_enabled(&mut self, event_name: &str, enabled: bool) {
        self.events.insert(event_name.to_string(), enabled);
    }
}
