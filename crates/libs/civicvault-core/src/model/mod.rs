//! # Model Layer - BMC Pattern
//!
//! Each entity has a data struct, a `ForCreate`/`ForUpdate` input struct
//! where needed, and a stateless `Bmc` controller with async CRUD methods.
//! Controllers take `(&Principal, &ModelManager, ...)` and never hold state.
//!
//! | BMC | Description |
//! |-----|-------------|
//! | `record::RecordBmc` | Index rows mirroring the records tree |
//! | `user::UserBmc` | Users, sessions, password-provider guard |
//! | `api_key::ApiKeyBmc` | Hashed API keys resolving to principals |
//! | `saga::SagaBmc` | Saga and step persistence |
//! | `resource_lock::ResourceLockBmc` | TTL-bounded exclusive claims |
//! | `activity::ActivityBmc` | Queryable mirror of the activity log |
//! | `setting::SettingBmc` | Schema version and operational flags |
//!
//! ## ModelManager
//!
//! The [`ModelManager`] provides centralized access to the database, the
//! records tree, and the git repository, plus the application-level writer
//! lock that serializes git mutations.

pub mod activity;
pub mod api_key;
pub mod record;
pub mod resource_lock;
pub mod saga;
pub mod setting;
pub mod user;

use crate::error::Result;
use crate::store::record_store::RecordStore;
use crate::store::{self, Db};
use civicvault_common::config::{AppConfig, DbTarget, Manifest, RunMode};
use git2::Repository;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct ModelManager {
    pub(crate) db: Db,
    /// Root of the civic data directory (holds `records/`, `.civic/`,
    /// `.system-data/`).
    pub data_dir: PathBuf,
    record_store: RecordStore,
    /// Serializes git mutations - git2's index locking doesn't handle
    /// concurrent writers well, so commits are queued at the application
    /// level. Readers against a fixed revision bypass this.
    pub git_lock: Arc<Mutex<()>>,
    pub app_config: Arc<AppConfig>,
    pub run_mode: RunMode,
}

impl ModelManager {
    /// Constructor. Resolves the database target from the manifest, applies
    /// migrations, and initializes the git working tree if needed.
    pub async fn new(
        manifest: &Manifest,
        manifest_dir: &Path,
        app_config: Arc<AppConfig>,
    ) -> Result<Self> {
        let data_dir = manifest.resolve_data_dir(manifest_dir);
        std::fs::create_dir_all(&data_dir)?;

        let DbTarget::Sqlite { file } = &manifest.database;
        let db_path = data_dir.join(file);
        let db = store::new_db_pool(&db_path).await?;

        // Auto-initialize the git repository if not present.
        store::git_store::init_or_open_repo(&data_dir)?;

        Ok(ModelManager {
            db,
            record_store: RecordStore::new(&data_dir),
            data_dir,
            git_lock: Arc::new(Mutex::new(())),
            app_config,
            run_mode: RunMode::from_env(),
        })
    }

    /// Constructor for testing with an already-built db and data dir.
    pub fn new_for_test(db: Db, data_dir: PathBuf, app_config: Arc<AppConfig>) -> Self {
        ModelManager {
            db,
            record_store: RecordStore::new(&data_dir),
            data_dir,
            git_lock: Arc::new(Mutex::new(())),
            app_config,
            run_mode: RunMode::Test,
        }
    }

    /// Opens the git repository at the data dir.
    ///
    /// `git2::Repository` is not `Sync`; callers open a handle per
    /// operation and hold [`Self::git_lock`] across mutations.
    pub fn open_repo(&self) -> Result<Repository> {
        store::git_store::open_repo(&self.data_dir)
    }

    pub fn record_store(&self) -> &RecordStore {
        &self.record_store
    }

    /// Returns the db connection reference (model layer only).
    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    /// Returns the db connection for integration tests.
    pub fn db_for_test(&self) -> &Db {
        &self.db
    }

    /// Health check - verify database connectivity.
    pub async fn health_check(&self) -> Result<bool> {
        let stmt = self.db.prepare("SELECT 1").await?;
        let mut rows = stmt.query(()).await?;
        Ok(rows.next().await?.is_some())
    }
}
