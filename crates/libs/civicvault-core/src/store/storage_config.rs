//! Storage limits (`.civic/storage.yml`).
//!
//! Caps what a single record may contain before the engine touches any
//! store. Limits are coarse tripwires against
//! pasted binaries and runaway imports, not a quota system.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum record body size in kilobytes.
    #[serde(default = "default_max_record_kb")]
    pub max_record_kb: u64,
    /// Maximum title length in characters.
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
    /// Subdirectories of the data dir that backups must include.
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
}

fn default_max_record_kb() -> u64 {
    1024
}

fn default_max_title_chars() -> usize {
    200
}

fn default_folders() -> Vec<String> {
    vec![
        "records".to_string(),
        ".civic".to_string(),
        ".system-data".to_string(),
    ]
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_record_kb: default_max_record_kb(),
            max_title_chars: default_max_title_chars(),
            folders: default_folders(),
        }
    }
}

impl StorageConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Size tripwire for a record body.
    pub fn check_body(&self, body: &str) -> Result<()> {
        let limit = self.max_record_kb * 1024;
        if body.len() as u64 > limit {
            return Err(Error::InvalidInput(format!(
                "record body is {} bytes, limit is {} KB",
                body.len(),
                self.max_record_kb
            )));
        }
        Ok(())
    }

    pub fn check_title(&self, title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(Error::InvalidInput("title must not be empty".to_string()));
        }
        if title.chars().count() > self.max_title_chars {
            return Err(Error::InvalidInput(format!(
                "title exceeds {} characters",
                self.max_title_chars
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_record_kb, 1024);
        assert!(config.folders.contains(&"records".to_string()));
    }

    #[test]
    fn test_body_limit() {
        let config = StorageConfig {
            max_record_kb: 1,
            ..Default::default()
        };
        assert!(config.check_body("short").is_ok());
        assert!(config.check_body(&"x".repeat(2048)).is_err());
    }

    #[test]
    fn test_title_limits() {
        let config = StorageConfig::default();
        assert!(config.check_title("Noise Restrictions").is_ok());
        assert!(config.check_title("   ").is_err());
        assert!(config.check_title(&"t".repeat(300)).is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let raw = "max_record_kb: 256\nfolders: [records]\n";
        let config: StorageConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.max_record_kb, 256);
        assert_eq!(config.max_title_chars, 200);
    }
}
