//! Configuration resolution for CivicVault.
//!
//! Two layers cooperate here:
//!
//! 1. The **root manifest** (`.civicrc`, YAML) lives at the top of a civic
//!    data directory and names the dataset: record types, default status,
//!    database target, feature toggles. It is discovered git-style by
//!    walking up from the current directory.
//! 2. The **application config** (`AppConfig`) layers hardcoded defaults,
//!    optional `config/{default,RUN_MODE}.toml` files, and `CIVIC_*`
//!    environment overrides, in that order of increasing priority.

use crate::error::{Error, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Database target, chosen in the manifest. SQLite is the default; the
/// variant set is closed so an unknown backend fails at parse time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbTarget {
    Sqlite {
        #[serde(default = "default_db_file")]
        file: String,
    },
}

fn default_db_file() -> String {
    ".system-data/civic.db".to_string()
}

impl Default for DbTarget {
    fn default() -> Self {
        DbTarget::Sqlite {
            file: default_db_file(),
        }
    }
}

/// The root manifest (`.civicrc`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    /// Data directory, relative to the manifest location unless absolute.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub database: DbTarget,
    #[serde(default = "default_record_types")]
    pub record_types: Vec<String>,
    #[serde(default = "default_status")]
    pub default_status: String,
    /// Statuses visible to the anonymous `public` role.
    #[serde(default = "default_published_statuses")]
    pub published_statuses: Vec<String>,
    #[serde(default = "default_true")]
    pub hooks_enabled: bool,
    /// Regenerate index.yml after every committed mutation.
    #[serde(default)]
    pub auto_index: bool,
}

fn default_data_dir() -> String {
    ".".to_string()
}

fn default_record_types() -> Vec<String> {
    [
        "bylaw",
        "policy",
        "resolution",
        "ordinance",
        "proclamation",
        "motion",
        "feedback",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_status() -> String {
    "draft".to_string()
}

fn default_published_statuses() -> Vec<String> {
    vec!["approved".to_string(), "archived".to_string()]
}

fn default_true() -> bool {
    true
}

impl Manifest {
    /// Walks up from `start` looking for a `.civicrc` file, git-style.
    ///
    /// Returns the parsed manifest together with the directory containing it.
    pub fn discover(start: &Path) -> Result<(Manifest, PathBuf)> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(".civicrc");
            if candidate.is_file() {
                let manifest = Self::load(&candidate)?;
                return Ok((manifest, dir));
            }
            if !dir.pop() {
                return Err(Error::ManifestNotFound {
                    start: start.display().to_string(),
                });
            }
        }
    }

    pub fn load(path: &Path) -> Result<Manifest> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| Error::InvalidManifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Resolves the data directory against the manifest's own location.
    pub fn resolve_data_dir(&self, manifest_dir: &Path) -> PathBuf {
        let p = Path::new(&self.data_dir);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            manifest_dir.join(p)
        }
    }
}

/// Run mode. Test mode selects deterministic saga scheduling: steps run
/// inline and lock acquisition fails fast instead of waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Development,
    Production,
    Test,
}

impl RunMode {
    pub fn from_env() -> Self {
        match env::var("RUN_MODE").as_deref() {
            Ok("production") => RunMode::Production,
            Ok("test") => RunMode::Test,
            _ => RunMode::Development,
        }
    }

    pub fn is_test(self) -> bool {
        self == RunMode::Test
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub activity: ActivityConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Per-operation deadline in seconds; lock TTL is twice this.
    pub operation_timeout_secs: u64,
    /// Transient-error retries inside a saga step.
    pub step_retries: u32,
    /// Base backoff between retries, milliseconds (doubles each attempt).
    pub retry_backoff_ms: u64,
    /// Bounded wait for a running saga with the same idempotency key.
    pub idempotency_wait_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ActivityConfig {
    /// Rotate activity.log once it exceeds this many bytes.
    pub rotate_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Debounce window for file-watcher invalidations, milliseconds.
    pub watch_debounce_ms: u64,
    pub default_max_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                operation_timeout_secs: 30,
                step_retries: 3,
                retry_backoff_ms: 50,
                idempotency_wait_ms: 5_000,
            },
            activity: ActivityConfig {
                rotate_bytes: 10 * 1024 * 1024,
            },
            cache: CacheConfig {
                watch_debounce_ms: 100,
                default_max_size: 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration with env var support.
    ///
    /// Priority order (highest to lowest):
    /// 1. `CIVIC_*` env vars (e.g. `CIVIC_ENGINE__STEP_RETRIES=5`)
    /// 2. Config files (`config/default.toml`, `config/{run_mode}.toml`)
    /// 3. Hardcoded defaults
    pub fn load() -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("engine.operation_timeout_secs", 30)?
            .set_default("engine.step_retries", 3)?
            .set_default("engine.retry_backoff_ms", 50)?
            .set_default("engine.idempotency_wait_ms", 5000)?
            .set_default("activity.rotate_bytes", 10 * 1024 * 1024)?
            .set_default("cache.watch_debounce_ms", 100)?
            .set_default("cache.default_max_size", 1024)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                config::Environment::with_prefix("CIVIC")
                    .separator("__")
                    .try_parsing(true),
            );

        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_manifest_defaults() {
        let manifest: Manifest = serde_yaml::from_str("name: townhall").expect("parse");
        assert_eq!(manifest.data_dir, ".");
        assert_eq!(manifest.default_status, "draft");
        assert!(manifest.hooks_enabled);
        assert!(manifest.record_types.contains(&"bylaw".to_string()));
        assert_eq!(manifest.database, DbTarget::default());
    }

    #[test]
    fn test_manifest_discover_walks_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).expect("mkdirs");
        std::fs::write(dir.path().join(".civicrc"), "name: townhall\n").expect("write");

        let (manifest, found_in) = Manifest::discover(&nested).expect("discover");
        assert_eq!(manifest.name, "townhall");
        assert_eq!(found_in, dir.path());
    }

    #[test]
    fn test_manifest_discover_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Manifest::discover(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestNotFound { .. }));
    }

    #[test]
    fn test_db_target_yaml_shape() {
        let manifest: Manifest =
            serde_yaml::from_str("name: t\ndatabase:\n  sqlite:\n    file: custom.db\n")
                .expect("parse");
        let DbTarget::Sqlite { file } = manifest.database;
        assert_eq!(file, "custom.db");
    }

    #[test]
    fn test_app_config_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.operation_timeout_secs, 30);
        assert_eq!(cfg.cache.watch_debounce_ms, 100);
    }
}
