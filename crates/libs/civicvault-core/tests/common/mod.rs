//! Common test utilities and fixtures.
//!
//! Each test gets its own isolated data directory: a fresh SQLite database,
//! a fresh git working tree, and a scaffolded `.civic/` config set.
//! Cleanup happens automatically via TempDir RAII.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use civicvault_common::config::{AppConfig, Manifest};
use civicvault_core::container::{Container, scaffold};
use civicvault_core::model::user::{UserBmc, UserForCreate};
use civicvault_core::{Principal, Result};
use std::sync::Arc;
use tempfile::TempDir;

/// Test context holding a wired container and ready-made principals.
pub struct TestContext {
    pub container: Container,
    /// System principal (admin, exempt from author checks).
    pub system: Principal,
    /// A records clerk: can create/edit, propose drafts.
    pub clerk: Principal,
    /// A council member: can approve and archive.
    pub council: Principal,
    /// Anonymous read-only principal.
    pub public: Principal,
    temp_dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        scaffold(temp_dir.path(), "test-civic")?;

        let manifest = Manifest::load(&temp_dir.path().join(".civicrc"))
            .expect("scaffolded manifest loads");
        let app_config = Arc::new(AppConfig::default());

        let container =
            Container::init_for_test(manifest, temp_dir.path().to_path_buf(), app_config).await?;

        let system = Principal::system();
        let clerk_id = UserBmc::create(
            &system,
            &container.mm,
            UserForCreate {
                username: "clerk-ada".to_string(),
                email: Some("ada@town.gov".to_string()),
                name: "Ada".to_string(),
                role: "clerk".to_string(),
                auth_provider: "password".to_string(),
                password_hash: Some("x".to_string()),
            },
        )
        .await?;
        let council_id = UserBmc::create(
            &system,
            &container.mm,
            UserForCreate {
                username: "council-rosa".to_string(),
                email: Some("rosa@town.gov".to_string()),
                name: "Rosa".to_string(),
                role: "council".to_string(),
                auth_provider: "password".to_string(),
                password_hash: Some("x".to_string()),
            },
        )
        .await?;

        Ok(Self {
            clerk: Principal::new(clerk_id.get(), "clerk-ada", "clerk"),
            council: Principal::new(council_id.get(), "council-rosa", "council"),
            public: Principal::public(),
            system,
            container,
            temp_dir,
        })
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self.container.mm.data_dir.clone()
    }

    /// Current git HEAD oid as a string, for no-new-commit assertions.
    pub fn head(&self) -> Option<String> {
        let repo = self.container.mm.open_repo().ok()?;
        civicvault_core::store::git_store::head_oid(&repo)
            .ok()
            .flatten()
            .map(|o| o.to_string())
    }
}
