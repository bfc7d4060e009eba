//! Dependency container: single-pass, leaves-first construction.
//!
//! Construction order is fixed: stores, then caches, then configuration,
//! then buses, then the executor, then the engine, and finally the
//! indexing service, which is constructor-pure and gets the engine
//! attached as an explicit second step. The container is a value; nothing
//! here is global.

use crate::Principal;
use crate::activity::{ActivityEntry, ActivityLog, Source};
use crate::cache::{CacheManager, CacheRegistration, Strategy};
use crate::engine::{RECORD_CACHE, RecordEngine};
use crate::error::Result;
use crate::hooks::{EventKind, HookBus, HookEvent, HooksConfig};
use crate::index::IndexingService;
use crate::model::ModelManager;
use crate::saga::SagaExecutor;
use crate::store::git_store;
use crate::store::storage_config::StorageConfig;
use crate::template::{TEMPLATE_CACHE, TemplateEngine};
use crate::workflow::WorkflowConfig;
use crate::workflow::roles::RolesConfig;
use civicvault_common::config::{AppConfig, Manifest};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Container {
    pub manifest: Arc<Manifest>,
    pub mm: ModelManager,
    pub caches: CacheManager,
    pub workflow: Arc<WorkflowConfig>,
    pub roles: Arc<RolesConfig>,
    pub hooks: HookBus,
    pub activity: ActivityLog,
    pub templates: TemplateEngine,
    pub executor: SagaExecutor,
    pub engine: RecordEngine,
    pub indexing: IndexingService,
}

impl Container {
    /// Builds every component in dependency order and runs startup
    /// reconciliation.
    pub async fn init(
        manifest: Manifest,
        manifest_dir: &Path,
        app_config: Arc<AppConfig>,
    ) -> Result<Container> {
        let manifest = Arc::new(manifest);
        let mm = ModelManager::new(&manifest, manifest_dir, app_config.clone()).await?;
        Self::wire(manifest, mm, app_config).await
    }

    /// Test constructor: same wiring over an isolated data dir, with the
    /// deterministic run mode the test ModelManager selects.
    pub async fn init_for_test(
        manifest: Manifest,
        data_dir: std::path::PathBuf,
        app_config: Arc<AppConfig>,
    ) -> Result<Container> {
        let db = crate::store::new_db_pool(&data_dir.join(".system-data").join("civic.db")).await?;
        git_store::init_or_open_repo(&data_dir)?;
        let mm = ModelManager::new_for_test(db, data_dir, app_config.clone());
        Self::wire(Arc::new(manifest), mm, app_config).await
    }

    async fn wire(
        manifest: Arc<Manifest>,
        mm: ModelManager,
        app_config: Arc<AppConfig>,
    ) -> Result<Container> {
        let civic_dir = mm.data_dir.join(".civic");

        // 2. Activity log.
        let activity = ActivityLog::new(
            mm.data_dir.join(".system-data").join("activity.log"),
            app_config.activity.rotate_bytes,
        );

        // 3. Caches.
        let caches = CacheManager::new(Duration::from_millis(app_config.cache.watch_debounce_ms));
        caches
            .register(CacheRegistration {
                name: RECORD_CACHE.to_string(),
                strategy: Strategy::Memory,
                default_ttl: Some(Duration::from_secs(60)),
                max_size: app_config.cache.default_max_size,
            })
            .await?;
        caches
            .register(CacheRegistration {
                name: TEMPLATE_CACHE.to_string(),
                strategy: Strategy::FileWatcher {
                    watch_paths: vec![civic_dir.join("templates"), civic_dir.join("partials")],
                },
                default_ttl: None,
                max_size: 64,
            })
            .await?;

        // 4. Configuration under .civic/.
        let workflow = Arc::new(WorkflowConfig::load(&civic_dir.join("workflows.yml"))?);
        let roles = Arc::new(RolesConfig::load(&civic_dir.join("roles.yml"))?);
        let storage = Arc::new(StorageConfig::load(&civic_dir.join("storage.yml"))?);
        let hooks_config = if manifest.hooks_enabled {
            HooksConfig::load(&civic_dir.join("hooks.yml"))?
        } else {
            HooksConfig {
                enabled: false,
                ..Default::default()
            }
        };

        // 5. Hook bus.
        let hooks = HookBus::new(activity.clone(), hooks_config);

        // 6. Saga executor; deterministic scheduling in test mode.
        let executor = SagaExecutor::new(&app_config, mm.run_mode.is_test());

        // 7. Templates.
        let templates = TemplateEngine::new(&civic_dir, caches.clone());

        // 8. Engine.
        let engine = RecordEngine::new(
            mm.clone(),
            manifest.clone(),
            workflow.clone(),
            storage,
            hooks.clone(),
            activity.clone(),
            caches.clone(),
            templates.clone(),
            executor.clone(),
        )
        .await;

        // 9. Indexing: constructor-pure, engine attached explicitly.
        let indexing = IndexingService::new(mm.clone(), hooks.clone(), activity.clone());
        indexing.attach_engine(engine.clone());

        let container = Container {
            manifest,
            mm,
            caches,
            workflow,
            roles,
            hooks,
            activity,
            templates,
            executor,
            engine,
            indexing,
        };
        container.startup().await?;
        Ok(container)
    }

    /// Startup reconciliation: compensate interrupted sagas, report (never
    /// auto-commit) untracked record files, start the watcher, announce.
    async fn startup(&self) -> Result<()> {
        let ctx = Principal::system();

        // Root commit: every later commit then has a parent, which keeps
        // saga compensation a plain reset instead of a revert.
        {
            let _git_guard = self.mm.git_lock.lock().await;
            let repo = self.mm.open_repo()?;
            if git_store::head_oid(&repo)?.is_none() {
                let attributes = self.mm.data_dir.join(".gitattributes");
                if !attributes.exists() {
                    std::fs::write(&attributes, "*.md text\n*.yml text\n")?;
                }
                let (name, email) = ctx.git_identity();
                git_store::commit_changes(
                    &repo,
                    &[Path::new(".gitattributes")],
                    &[] as &[&Path],
                    "chore: initialize civic repository",
                    &name,
                    &email,
                )?;
            }
        }

        let recovered = self.executor.recover(&ctx, &self.mm).await?;
        if recovered > 0 {
            info!(recovered, "compensated interrupted sagas");
        }

        match self.mm.open_repo().and_then(|repo| git_store::untracked_paths(&repo)) {
            Ok(untracked) => {
                let records: Vec<_> = untracked
                    .into_iter()
                    .filter(|p| p.starts_with("records/") && p.ends_with(".md"))
                    .collect();
                if !records.is_empty() {
                    // Default policy: leave as uncommitted changes.
                    warn!(count = records.len(), ?records, "untracked record files found; left uncommitted");
                    let entry =
                        ActivityEntry::now(Source::Workflow, ctx.username(), "startup.untracked")
                            .with_metadata(json!({ "paths": records }));
                    self.activity.append(&ctx, &self.mm, &entry).await?;
                }
            }
            Err(e) => warn!(error = %e, "untracked scan failed"),
        }

        if !self.mm.run_mode.is_test() {
            self.caches.start_watcher().await?;
        }

        self.hooks
            .emit(
                &ctx,
                &self.mm,
                Source::Workflow,
                HookEvent::new(
                    EventKind::CivicInitialized,
                    json!({"name": self.manifest.name}),
                ),
                &[],
            )
            .await?;
        Ok(())
    }
}

/// Scaffolds a fresh civic data directory: manifest, `.civic/` configs,
/// records tree. Used by `civic init`.
pub fn scaffold(dir: &Path, name: &str) -> Result<()> {
    std::fs::create_dir_all(dir.join(".civic/templates"))?;
    std::fs::create_dir_all(dir.join(".civic/partials"))?;
    std::fs::create_dir_all(dir.join("records"))?;
    std::fs::create_dir_all(dir.join(".system-data"))?;

    let manifest_path = dir.join(".civicrc");
    if !manifest_path.exists() {
        let manifest = Manifest {
            name: name.to_string(),
            data_dir: ".".to_string(),
            database: Default::default(),
            record_types: default_types(),
            default_status: "draft".to_string(),
            published_statuses: vec!["approved".to_string(), "archived".to_string()],
            hooks_enabled: true,
            auto_index: false,
        };
        std::fs::write(&manifest_path, serde_yaml::to_string(&manifest)?)?;
    }

    let workflows_path = dir.join(".civic/workflows.yml");
    if !workflows_path.exists() {
        std::fs::write(
            &workflows_path,
            serde_yaml::to_string(&WorkflowConfig::default_civic())?,
        )?;
    }

    let hooks_path = dir.join(".civic/hooks.yml");
    if !hooks_path.exists() {
        HooksConfig::default().save(&hooks_path)?;
    }

    Ok(())
}

fn default_types() -> Vec<String> {
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
