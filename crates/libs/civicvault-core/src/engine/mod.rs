//! Record Manager: the public orchestrator.
//!
//! Composes the record store, git gateway, index database, workflow engine,
//! hook bus, caches, and activity log under one transactional contract.
//! Every mutation runs inside a saga; any failure past the first mutating
//! step compensates everything before it, in reverse.
//!
//! Collaborators never call back into the engine; the dependency arrow
//! points one way, which is what keeps the construction order a simple
//! leaves-first pass (see [`crate::container`]).

pub mod compensations;
pub mod input;

pub use input::{OpContext, RecordInput, RecordPatch, ValidationReport};

use crate::Principal;
use crate::activity::{ActivityEntry, ActivityLog};
use crate::cache::CacheManager;
use crate::error::{Error, Result};
use crate::hooks::{EventKind, HookBus, HookEvent};
use crate::model::ModelManager;
use crate::model::record::{Page, Record, RecordBmc, RecordFilter, RecordForUpsert};
use crate::model::user::UserBmc;
use crate::saga::{BeginOutcome, SagaExecutor};
use crate::store::frontmatter::{self, Frontmatter, RecordDoc};
use crate::store::git_store::{self, Revision};
use crate::store::record_store::RecordStore;
use crate::store::storage_config::StorageConfig;
use crate::template::TemplateEngine;
use crate::types::{RecordId, RecordSlug, RecordType};
use crate::utils::slugger;
use crate::utils::validation;
use crate::workflow::{self, Action, WorkflowConfig};
use chrono::NaiveDateTime;
use civicvault_common::config::Manifest;
use compensations::{
    ArchiveFilePayload, CommitPayload, DeletePayload, InsertPayload, RewriteFilePayload,
    RowSnapshot, UnarchiveFilePayload, UpdatePayload, WriteFilePayload, STEP_ARCHIVE_FILE,
    STEP_DB_DELETE, STEP_DB_INSERT, STEP_DB_UPDATE, STEP_EMIT_HOOKS, STEP_GIT_COMMIT,
    STEP_REWRITE_FILE, STEP_UNARCHIVE_FILE, STEP_WRITE_FILE,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Cache name for record metadata lookups.
pub const RECORD_CACHE: &str = "records";

#[derive(Clone)]
pub struct RecordEngine {
    mm: ModelManager,
    manifest: Arc<Manifest>,
    workflow: Arc<WorkflowConfig>,
    storage: Arc<StorageConfig>,
    hooks: HookBus,
    activity: ActivityLog,
    caches: CacheManager,
    templates: TemplateEngine,
    executor: SagaExecutor,
}

impl RecordEngine {
    /// Constructor; registers every step compensator on the executor.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        mm: ModelManager,
        manifest: Arc<Manifest>,
        workflow: Arc<WorkflowConfig>,
        storage: Arc<StorageConfig>,
        hooks: HookBus,
        activity: ActivityLog,
        caches: CacheManager,
        templates: TemplateEngine,
        executor: SagaExecutor,
    ) -> Self {
        use compensations::{
            DbDeleteComp, DbInsertComp, DbUpdateComp, FileArchiveComp, FileRewriteComp,
            FileUnarchiveComp, FileWriteComp, GitCommitComp,
        };

        executor
            .register_compensator(STEP_WRITE_FILE, Arc::new(FileWriteComp))
            .await;
        executor
            .register_compensator(STEP_REWRITE_FILE, Arc::new(FileRewriteComp))
            .await;
        executor
            .register_compensator(STEP_ARCHIVE_FILE, Arc::new(FileArchiveComp))
            .await;
        executor
            .register_compensator(STEP_UNARCHIVE_FILE, Arc::new(FileUnarchiveComp))
            .await;
        executor
            .register_compensator(STEP_GIT_COMMIT, Arc::new(GitCommitComp))
            .await;
        executor
            .register_compensator(STEP_DB_INSERT, Arc::new(DbInsertComp))
            .await;
        executor
            .register_compensator(STEP_DB_UPDATE, Arc::new(DbUpdateComp))
            .await;
        executor
            .register_compensator(STEP_DB_DELETE, Arc::new(DbDeleteComp))
            .await;

        RecordEngine {
            mm,
            manifest,
            workflow,
            storage,
            hooks,
            activity,
            caches,
            templates,
            executor,
        }
    }

    pub fn mm(&self) -> &ModelManager {
        &self.mm
    }

    pub fn workflow(&self) -> &WorkflowConfig {
        &self.workflow
    }

    pub fn hooks(&self) -> &HookBus {
        &self.hooks
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn executor(&self) -> &SagaExecutor {
        &self.executor
    }

    // -- create

    /// Creates a record: file write, commit, index insert, hooks, or
    /// nothing at all.
    pub async fn create(
        &self,
        ctx: &Principal,
        op: &OpContext,
        input: RecordInput,
    ) -> Result<Record> {
        let record_type = RecordType::new(input.record_type.clone());
        self.check_type(&record_type)?;
        workflow::can_act(&self.workflow, ctx.role(), Action::Create, record_type.as_str())?;

        // Dry run: full preparation (author checks, slug probe, template
        // render), intent audited, nothing persisted, not even a saga row.
        if op.dry_run {
            let prep = self.prepare_create(ctx, &record_type, &input).await?;
            self.audit(ctx, op, "record:create.started", &prep.record_id, "ok", None)
                .await?;
            self.audit(ctx, op, "record:create.dry-run", &prep.record_id, "ok", None)
                .await?;
            return Ok(self.doc_to_record(&prep.doc, &prep.record_id, &record_type, &prep.slug));
        }

        // Idempotency replay settles before any slug probing: a replayed
        // call must observe the original result, not a fresh `-2` slug.
        let mm = &self.mm;
        let outcome = self
            .executor
            .begin(ctx, mm, "record.create", op.idempotency_key.as_deref())
            .await?;
        let mut handle = match outcome {
            BeginOutcome::Replayed(value) => {
                let record: Record = serde_json::from_value(value)?;
                self.audit(ctx, op, "record:create.replayed", &record.id, "ok", None)
                    .await?;
                return Ok(record);
            }
            BeginOutcome::Started(h) => h,
        };

        let CreatePrep {
            slug,
            record_id,
            status,
            author,
            authors,
            now,
            doc,
        } = self.prepare_create(ctx, &record_type, &input).await?;

        self.audit(ctx, op, "record:create.started", &record_id, "ok", None)
            .await?;

        let resource_id = format!("record:{record_id}");
        self.executor
            .acquire_lock(ctx, mm, &mut handle, &resource_id)
            .await?;

        let rel = RecordStore::record_rel_path(&record_type, &slug);
        let run = async {
            // (a) file write
            let store = mm.record_store().clone();
            let doc_for_write = doc.clone();
            let rel_for_write = rel.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_WRITE_FILE, || {
                    let store = store.clone();
                    let doc = doc_for_write.clone();
                    let rel = rel_for_write.clone();
                    async move {
                        store.write(&rel, &doc)?;
                        Ok(WriteFilePayload { path: rel })
                    }
                })
                .await?;

            // (b) stage + commit
            let message = format!("feat({}): add {}", record_type, slug);
            let oid = self
                .commit_step(ctx, mm, &mut handle, vec![rel.clone()], vec![], message)
                .await?;

            // (c) index row
            let upsert = RecordForUpsert {
                id: record_id.clone(),
                record_type: record_type.clone(),
                slug: slug.clone(),
                title: input.title.clone(),
                status: status.clone(),
                author: author.clone(),
                path: rel.display().to_string(),
                authors: authors.clone(),
                metadata: input.metadata.clone().unwrap_or(json!({})),
                created_at: now,
                updated_at: now,
            };
            let caches = self.caches.clone();
            let upsert_for_step = upsert.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_DB_INSERT, || {
                    let upsert = upsert_for_step.clone();
                    let caches = caches.clone();
                    async move {
                        RecordBmc::insert(ctx, mm, &upsert).await?;
                        caches.invalidate(RECORD_CACHE).await;
                        Ok(InsertPayload {
                            id: upsert.id.to_string(),
                        })
                    }
                })
                .await?;

            // (d) hooks
            let payload = json!({
                "id": record_id.as_str(),
                "type": record_type.as_str(),
                "slug": slug.as_str(),
                "status": status,
                "commit": oid,
            });
            self.emit_step(
                ctx,
                op,
                &mut handle,
                vec![
                    HookEvent::new(EventKind::RecordCreated, payload.clone()),
                    HookEvent::new(EventKind::RecordCommitted, payload),
                ],
            )
            .await?;

            Ok::<_, Error>(())
        }
        .await;

        match run {
            Ok(()) => {
                let record = self.get_unchecked(ctx, &record_id).await?;
                self.executor
                    .commit(ctx, mm, handle, &serde_json::to_value(&record)?)
                    .await?;
                self.audit(ctx, op, "record:create.completed", &record_id, "success", None)
                    .await?;
                Ok(record)
            }
            Err(e) => {
                self.audit(
                    ctx,
                    op,
                    "record:create.compensated",
                    &record_id,
                    "failure",
                    Some(json!({"error": e.to_string()})),
                )
                .await?;
                Err(e)
            }
        }
    }

    // -- update / set_status

    /// Updates a record. Body fully replaces when provided; metadata is
    /// shallow-merged; a status change additionally passes the transition
    /// check.
    pub async fn update(
        &self,
        ctx: &Principal,
        op: &OpContext,
        id_or_path: &str,
        patch: RecordPatch,
    ) -> Result<Record> {
        self.update_inner(ctx, op, id_or_path, patch, "record:update", false, None)
            .await
    }

    /// Status-only specialization of `update`; emits `record:status-changed`
    /// in addition. A transition to the current status is an audited no-op.
    pub async fn set_status(
        &self,
        ctx: &Principal,
        op: &OpContext,
        id_or_path: &str,
        new_status: &str,
        message: Option<&str>,
    ) -> Result<Record> {
        let current = self.resolve(ctx, id_or_path).await?;
        if current.status == new_status {
            self.audit(
                ctx,
                op,
                "record:status.unchanged",
                &current.id,
                "ok",
                Some(json!({"status": new_status})),
            )
            .await?;
            return self.get(ctx, id_or_path).await;
        }

        let patch = RecordPatch {
            status: Some(new_status.to_string()),
            ..Default::default()
        };
        self.update_inner(ctx, op, id_or_path, patch, "record:status", true, message)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_inner(
        &self,
        ctx: &Principal,
        op: &OpContext,
        id_or_path: &str,
        patch: RecordPatch,
        audit_prefix: &str,
        status_change: bool,
        commit_message: Option<&str>,
    ) -> Result<Record> {
        let current = self.resolve(ctx, id_or_path).await?;
        let record_type = current.record_type.clone();
        let slug = current.slug.clone();
        let record_id = current.id.clone();

        workflow::can_act(&self.workflow, ctx.role(), Action::Edit, record_type.as_str())?;

        if let Some(new_status) = &patch.status {
            workflow::can_transition(
                &self.workflow,
                ctx.role(),
                record_type.as_str(),
                &current.status,
                new_status,
            )?;
        }

        if let Some(expected) = op.expected_updated_at {
            if expected != current.updated_at {
                return Err(Error::StaleUpdate {
                    expected: frontmatter::format_datetime(expected),
                    actual: frontmatter::format_datetime(current.updated_at),
                });
            }
        }

        if let Some(authors) = &patch.authors {
            for entry in authors {
                self.check_author_known(ctx, &entry.username).await?;
            }
        }

        let started = format!("{audit_prefix}.started");
        self.audit(ctx, op, &started, &record_id, "ok", None).await?;

        let rel = Path::new(&current.path).to_path_buf();
        let previous_doc = self.mm.record_store().read(&rel)?;
        let previous_raw = self.mm.record_store().read_raw(&rel)?;

        // Merge.
        let now = later_of(now_ts(), current.created_at);
        let new_status = patch.status.clone().unwrap_or_else(|| current.status.clone());
        let new_title = patch.title.clone().unwrap_or_else(|| current.title.clone());
        let new_body = patch.content.clone().unwrap_or_else(|| previous_doc.body.clone());
        self.storage.check_title(&new_title)?;
        self.storage.check_body(&new_body)?;
        let new_authors = patch.authors.clone().unwrap_or_else(|| current.authors.clone());
        let merged_metadata = shallow_merge(&current.metadata, patch.metadata.as_ref());

        let doc = RecordDoc {
            front: Frontmatter {
                id: Some(record_id.to_string()),
                title: new_title.clone(),
                record_type: record_type.to_string(),
                status: new_status.clone(),
                slug: Some(slug.to_string()),
                author: Some(current.author.clone()),
                authors: new_authors.clone(),
                created_at: Some(current.created_at),
                updated_at: Some(now),
                metadata: json_to_yaml_mapping(Some(&merged_metadata)),
            },
            body: new_body,
        };

        if op.dry_run {
            self.audit(ctx, op, &format!("{audit_prefix}.dry-run"), &record_id, "ok", None)
                .await?;
            return Ok(self.doc_to_record(&doc, &record_id, &record_type, &slug));
        }

        let mm = &self.mm;
        let outcome = self
            .executor
            .begin(ctx, mm, "record.update", op.idempotency_key.as_deref())
            .await?;
        let mut handle = match outcome {
            BeginOutcome::Replayed(value) => return Ok(serde_json::from_value(value)?),
            BeginOutcome::Started(h) => h,
        };

        let resource_id = format!("record:{record_id}");
        self.executor
            .acquire_lock(ctx, mm, &mut handle, &resource_id)
            .await?;

        let run = async {
            // (a) rewrite file, keeping prior bytes for compensation
            let store = mm.record_store().clone();
            let doc_for_write = doc.clone();
            let rel_for_write = rel.clone();
            let previous = previous_raw.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_REWRITE_FILE, || {
                    let store = store.clone();
                    let doc = doc_for_write.clone();
                    let rel = rel_for_write.clone();
                    let previous_content = previous.clone();
                    async move {
                        store.write(&rel, &doc)?;
                        Ok(RewriteFilePayload {
                            path: rel,
                            previous_content,
                        })
                    }
                })
                .await?;

            // (b) commit
            let message = match commit_message {
                Some(m) => m.to_string(),
                None if status_change => format!(
                    "update({}): {} [{} -> {}]",
                    record_type, slug, current.status, new_status
                ),
                None => format!("update({}): {}", record_type, slug),
            };
            let oid = self
                .commit_step(ctx, mm, &mut handle, vec![rel.clone()], vec![], message)
                .await?;

            // (c) index row
            let upsert = RecordForUpsert {
                id: record_id.clone(),
                record_type: record_type.clone(),
                slug: slug.clone(),
                title: new_title.clone(),
                status: new_status.clone(),
                author: current.author.clone(),
                path: current.path.clone(),
                authors: new_authors.clone(),
                metadata: merged_metadata.clone(),
                created_at: current.created_at,
                updated_at: now,
            };
            let snapshot = RowSnapshot::of(&current);
            let caches = self.caches.clone();
            let upsert_for_step = upsert.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_DB_UPDATE, || {
                    let upsert = upsert_for_step.clone();
                    let previous = snapshot.clone();
                    let caches = caches.clone();
                    async move {
                        RecordBmc::update(ctx, mm, &upsert).await?;
                        caches.invalidate(RECORD_CACHE).await;
                        Ok(UpdatePayload { previous })
                    }
                })
                .await?;

            // (d) hooks
            let payload = json!({
                "id": record_id.as_str(),
                "type": record_type.as_str(),
                "slug": slug.as_str(),
                "status": new_status,
                "previous_status": current.status,
                "commit": oid,
            });
            let mut events = vec![HookEvent::new(EventKind::RecordUpdated, payload.clone())];
            if status_change {
                events.push(HookEvent::new(EventKind::RecordStatusChanged, payload.clone()));
            }
            events.push(HookEvent::new(EventKind::RecordCommitted, payload));
            self.emit_step(ctx, op, &mut handle, events).await?;

            Ok::<_, Error>(())
        }
        .await;

        match run {
            Ok(()) => {
                let record = self.get_unchecked(ctx, &record_id).await?;
                self.executor
                    .commit(ctx, mm, handle, &serde_json::to_value(&record)?)
                    .await?;
                self.audit(
                    ctx,
                    op,
                    &format!("{audit_prefix}.completed"),
                    &record_id,
                    "success",
                    None,
                )
                .await?;
                Ok(record)
            }
            Err(e) => {
                self.audit(
                    ctx,
                    op,
                    &format!("{audit_prefix}.compensated"),
                    &record_id,
                    "failure",
                    Some(json!({"error": e.to_string()})),
                )
                .await?;
                Err(e)
            }
        }
    }

    // -- delete

    /// Archives a record: file moves to the archive subtree, the index row
    /// is dropped, history is preserved.
    pub async fn delete(&self, ctx: &Principal, op: &OpContext, id_or_path: &str) -> Result<()> {
        let current = self.resolve(ctx, id_or_path).await?;
        let record_type = current.record_type.clone();
        let slug = current.slug.clone();
        let record_id = current.id.clone();

        workflow::can_act(&self.workflow, ctx.role(), Action::Delete, record_type.as_str())?;

        self.audit(ctx, op, "record:delete.started", &record_id, "ok", None)
            .await?;

        if op.dry_run {
            self.audit(ctx, op, "record:delete.dry-run", &record_id, "ok", None)
                .await?;
            return Ok(());
        }

        let mm = &self.mm;
        let outcome = self
            .executor
            .begin(ctx, mm, "record.delete", op.idempotency_key.as_deref())
            .await?;
        let mut handle = match outcome {
            BeginOutcome::Replayed(_) => return Ok(()),
            BeginOutcome::Started(h) => h,
        };

        let resource_id = format!("record:{record_id}");
        self.executor
            .acquire_lock(ctx, mm, &mut handle, &resource_id)
            .await?;

        let live_rel = RecordStore::record_rel_path(&record_type, &slug);
        let archive_rel = RecordStore::archive_rel_path(&record_type, &slug);

        let run = async {
            // (a) move to archive
            let store = mm.record_store().clone();
            let rt = record_type.clone();
            let sl = slug.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_ARCHIVE_FILE, || {
                    let store = store.clone();
                    let record_type = rt.clone();
                    let slug = sl.clone();
                    async move {
                        store.archive(&record_type, &slug)?;
                        Ok(ArchiveFilePayload {
                            record_type: record_type.to_string(),
                            slug: slug.to_string(),
                        })
                    }
                })
                .await?;

            // (b) commit the move
            let message = format!("archive({}): {}", record_type, slug);
            let oid = self
                .commit_step(
                    ctx,
                    mm,
                    &mut handle,
                    vec![archive_rel.clone()],
                    vec![live_rel.clone()],
                    message,
                )
                .await?;

            // (c) drop index row
            let snapshot = RowSnapshot::of(&current);
            let caches = self.caches.clone();
            let id_for_step = record_id.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_DB_DELETE, || {
                    let id = id_for_step.clone();
                    let previous = snapshot.clone();
                    let caches = caches.clone();
                    async move {
                        RecordBmc::delete(ctx, mm, &id).await?;
                        caches.invalidate(RECORD_CACHE).await;
                        Ok(DeletePayload { previous })
                    }
                })
                .await?;

            // (d) hooks
            let payload = json!({
                "id": record_id.as_str(),
                "type": record_type.as_str(),
                "slug": slug.as_str(),
                "commit": oid,
            });
            self.emit_step(
                ctx,
                op,
                &mut handle,
                vec![
                    HookEvent::new(EventKind::RecordDeleted, payload.clone()),
                    HookEvent::new(EventKind::RecordCommitted, payload),
                ],
            )
            .await?;

            Ok::<_, Error>(())
        }
        .await;

        match run {
            Ok(()) => {
                self.executor
                    .commit(ctx, mm, handle, &json!({"deleted": record_id.as_str()}))
                    .await?;
                self.audit(ctx, op, "record:delete.completed", &record_id, "success", None)
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.audit(
                    ctx,
                    op,
                    "record:delete.compensated",
                    &record_id,
                    "failure",
                    Some(json!({"error": e.to_string()})),
                )
                .await?;
                Err(e)
            }
        }
    }

    // -- restore

    /// Restores an archived record to the live tree, re-indexing it.
    ///
    /// The inverse of [`Self::delete`]: the record's history continues in
    /// place, and the row is rebuilt from the archived frontmatter.
    pub async fn restore(
        &self,
        ctx: &Principal,
        op: &OpContext,
        id_or_path: &str,
    ) -> Result<Record> {
        let id = normalize_id(id_or_path);
        let Some((type_str, slug_str)) = id.split_once('/') else {
            return Err(Error::InvalidInput(format!("not a record id: {id_or_path}")));
        };
        let record_type = RecordType::new(type_str);
        let slug = RecordSlug::new(slug_str);
        self.check_type(&record_type)?;
        workflow::can_act(&self.workflow, ctx.role(), Action::Create, record_type.as_str())?;

        let archive_rel = RecordStore::archive_rel_path(&record_type, &slug);
        let live_rel = RecordStore::record_rel_path(&record_type, &slug);
        if !self.mm.record_store().exists(&archive_rel) {
            return Err(Error::RecordNotFound(archive_rel.display().to_string()));
        }
        if RecordBmc::slug_taken(&self.mm, &record_type, &slug).await?
            || self.mm.record_store().exists(&live_rel)
        {
            return Err(Error::SlugConflict {
                record_type: record_type.to_string(),
                slug: slug.to_string(),
            });
        }

        let doc = self.mm.record_store().read(&archive_rel)?;
        let record_id = RecordId::new(id.clone());

        self.audit(ctx, op, "record:restore.started", &record_id, "ok", None)
            .await?;
        if op.dry_run {
            self.audit(ctx, op, "record:restore.dry-run", &record_id, "ok", None)
                .await?;
            return Ok(self.doc_to_record(&doc, &record_id, &record_type, &slug));
        }

        let mm = &self.mm;
        let outcome = self
            .executor
            .begin(ctx, mm, "record.restore", op.idempotency_key.as_deref())
            .await?;
        let mut handle = match outcome {
            BeginOutcome::Replayed(value) => return Ok(serde_json::from_value(value)?),
            BeginOutcome::Started(h) => h,
        };

        let resource_id = format!("record:{record_id}");
        self.executor
            .acquire_lock(ctx, mm, &mut handle, &resource_id)
            .await?;

        let run = async {
            // (a) move back to the live tree
            let store = mm.record_store().clone();
            let rt = record_type.clone();
            let sl = slug.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_UNARCHIVE_FILE, || {
                    let store = store.clone();
                    let record_type = rt.clone();
                    let slug = sl.clone();
                    async move {
                        store.unarchive(&record_type, &slug)?;
                        Ok(UnarchiveFilePayload {
                            record_type: record_type.to_string(),
                            slug: slug.to_string(),
                        })
                    }
                })
                .await?;

            // (b) commit the move
            let message = format!("restore({}): {}", record_type, slug);
            let oid = self
                .commit_step(
                    ctx,
                    mm,
                    &mut handle,
                    vec![live_rel.clone()],
                    vec![archive_rel.clone()],
                    message,
                )
                .await?;

            // (c) rebuild the index row from the archived frontmatter
            let now = now_ts();
            let upsert = RecordForUpsert {
                id: record_id.clone(),
                record_type: record_type.clone(),
                slug: slug.clone(),
                title: doc.front.title.clone(),
                status: doc.front.status.clone(),
                author: doc
                    .front
                    .author
                    .clone()
                    .unwrap_or_else(|| ctx.username().to_string()),
                path: live_rel.display().to_string(),
                authors: doc.front.authors.clone(),
                metadata: yaml_mapping_to_json(&doc.front.metadata),
                created_at: doc.front.created_at.unwrap_or(now),
                updated_at: now,
            };
            let caches = self.caches.clone();
            let upsert_for_step = upsert.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_DB_INSERT, || {
                    let upsert = upsert_for_step.clone();
                    let caches = caches.clone();
                    async move {
                        RecordBmc::insert(ctx, mm, &upsert).await?;
                        caches.invalidate(RECORD_CACHE).await;
                        Ok(InsertPayload {
                            id: upsert.id.to_string(),
                        })
                    }
                })
                .await?;

            // (d) hooks
            let payload = json!({
                "id": record_id.as_str(),
                "type": record_type.as_str(),
                "slug": slug.as_str(),
                "status": doc.front.status,
                "commit": oid,
            });
            self.emit_step(
                ctx,
                op,
                &mut handle,
                vec![
                    HookEvent::new(EventKind::RecordUpdated, payload.clone()),
                    HookEvent::new(EventKind::RecordCommitted, payload),
                ],
            )
            .await?;

            Ok::<_, Error>(())
        }
        .await;

        match run {
            Ok(()) => {
                let record = self.get_unchecked(ctx, &record_id).await?;
                self.executor
                    .commit(ctx, mm, handle, &serde_json::to_value(&record)?)
                    .await?;
                self.audit(ctx, op, "record:restore.completed", &record_id, "success", None)
                    .await?;
                Ok(record)
            }
            Err(e) => {
                self.audit(
                    ctx,
                    op,
                    "record:restore.compensated",
                    &record_id,
                    "failure",
                    Some(json!({"error": e.to_string()})),
                )
                .await?;
                Err(e)
            }
        }
    }

    // -- reads

    /// Fetches a record with content. The `public` role only sees records
    /// in published statuses; hidden records are indistinguishable from
    /// missing ones.
    pub async fn get(&self, ctx: &Principal, id_or_path: &str) -> Result<Record> {
        let mut record = self.resolve_for_view(ctx, id_or_path).await?;
        let doc = self.mm.record_store().read(Path::new(&record.path))?;
        record.content = doc.body;
        Ok(record)
    }

    /// DB-authoritative listing with the role filter applied.
    pub async fn list(
        &self,
        ctx: &Principal,
        filter: RecordFilter,
    ) -> Result<Page<Record>> {
        let mut filter = filter.with_default_page();

        if let Some(t) = &filter.record_type {
            workflow::can_act(&self.workflow, ctx.role(), Action::View, t.as_str())?;
        }
        if ctx.role() == "public" {
            filter.visible_statuses = Some(self.manifest.published_statuses.clone());
        }

        let mut page = RecordBmc::list(ctx, &self.mm, &filter).await?;

        // Per-row view filter for untyped listings.
        if filter.record_type.is_none() {
            page.items.retain(|r| {
                workflow::can_act(&self.workflow, ctx.role(), Action::View, r.record_type.as_str())
                    .is_ok()
            });
        }
        Ok(page)
    }

    /// History of the record's backing file, newest first. Gated like
    /// `get`: history of a hidden record would leak its content.
    pub async fn history(&self, ctx: &Principal, id_or_path: &str) -> Result<Vec<Revision>> {
        let record = self.resolve_for_view(ctx, id_or_path).await?;
        let repo = self.mm.open_repo()?;
        git_store::history(&repo, Path::new(&record.path))
    }

    /// Unified diff of the record between two revisions. Gated like `get`.
    pub async fn diff(
        &self,
        ctx: &Principal,
        id_or_path: &str,
        rev1: &str,
        rev2: &str,
    ) -> Result<String> {
        let record = self.resolve_for_view(ctx, id_or_path).await?;
        let repo = self.mm.open_repo()?;
        git_store::diff(&repo, rev1, rev2, Some(Path::new(&record.path)))
    }

    // -- validate

    /// Offline validation of record file content. Collects every problem
    /// instead of failing on the first.
    pub async fn validate_content(
        &self,
        ctx: &Principal,
        content: &str,
        path: &str,
    ) -> Result<ValidationReport> {
        let mut errors = Vec::new();

        let doc = match frontmatter::parse(content, path) {
            Ok(d) => d,
            Err(e) => {
                return Ok(ValidationReport {
                    valid: false,
                    errors: vec![e.to_string()],
                });
            }
        };
        let front = &doc.front;

        if front.title.is_empty() {
            errors.push("missing required field: title".to_string());
        }
        if front.record_type.is_empty() {
            errors.push("missing required field: type".to_string());
        } else if !self
            .manifest
            .record_types
            .iter()
            .any(|t| t == &front.record_type)
        {
            errors.push(format!("unknown record type: {}", front.record_type));
        }
        if front.status.is_empty() {
            errors.push("missing required field: status".to_string());
        } else if !front.record_type.is_empty()
            && !self
                .workflow
                .statuses_for(&front.record_type)
                .iter()
                .any(|s| s == &front.status)
        {
            errors.push(format!("unknown status: {}", front.status));
        }

        if let Some(slug) = &front.slug {
            if let Err(e) = validation::validate_slug(slug) {
                errors.push(e.to_string());
            } else if !front.record_type.is_empty() {
                // Uniqueness: another record may not hold this (type, slug).
                let taken = RecordBmc::get_by_type_slug(
                    ctx,
                    &self.mm,
                    &RecordType::new(front.record_type.clone()),
                    &RecordSlug::new(slug.clone()),
                )
                .await;
                if let Ok(existing) = taken {
                    if front.id.as_deref() != Some(existing.id.as_str()) {
                        errors.push(format!(
                            "slug conflict: {}/{} already taken by {}",
                            front.record_type, slug, existing.id
                        ));
                    }
                }
            }
        }

        if let Some(author) = &front.author {
            if !UserBmc::exists(&self.mm, author).await? {
                errors.push(format!("author not found: {author}"));
            }
        }

        // Date shape is checked against the raw strings; the tolerant
        // parser would have silently dropped a malformed value.
        for key in ["created_at", "updated_at"] {
            if let Some(raw) = raw_frontmatter_value(content, key) {
                if let Err(e) = validation::validate_iso_date(&raw) {
                    errors.push(e.to_string());
                }
            }
        }

        if let Some(tags) = front.metadata.get(serde_yaml::Value::from("tags")) {
            match tags.as_sequence() {
                Some(seq) => {
                    for tag in seq {
                        match tag.as_str() {
                            Some(t) => {
                                if let Err(e) = validation::validate_tag(t) {
                                    errors.push(e.to_string());
                                }
                            }
                            None => errors.push("tags must be strings".to_string()),
                        }
                    }
                }
                None => errors.push("metadata.tags must be an array".to_string()),
            }
        }

        Ok(ValidationReport {
            valid: errors.is_empty(),
            errors,
        })
    }

    /// Validates an indexed record's backing file.
    pub async fn validate(&self, ctx: &Principal, id_or_path: &str) -> Result<ValidationReport> {
        let record = self.resolve(ctx, id_or_path).await?;
        let raw = self.mm.record_store().read_raw(Path::new(&record.path))?;
        self.validate_content(ctx, &raw, &record.path).await
    }

    // -- export / import

    /// Copies the records tree (live + archive + index.yml) to `dest`.
    ///
    /// Export is a whole-tree read, so it requires view over every type:
    /// only a `*` view grant (or admin) passes.
    pub async fn export(&self, ctx: &Principal, dest: &Path) -> Result<usize> {
        workflow::can_act(&self.workflow, ctx.role(), Action::View, "*")?;
        if ctx.role() == "public" {
            // The tree includes drafts the public filter would hide.
            return Err(Error::action_denied(ctx.role(), "export", "*"));
        }

        let src_root = self.mm.data_dir.join("records");
        if !src_root.is_dir() {
            return Ok(0);
        }

        let mut copied = 0;
        let walker = ignore::WalkBuilder::new(&src_root).hidden(true).build();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let rel = path
                .strip_prefix(&self.mm.data_dir)
                .map_err(|_| Error::InvalidInput("export path escape".into()))?;
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(path, &target)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Imports record files from an exported tree, preserving ids, slugs,
    /// statuses, and timestamps. Each record lands in its own saga.
    pub async fn import(&self, ctx: &Principal, op: &OpContext, src: &Path) -> Result<usize> {
        let src_records = src.join("records");
        if !src_records.is_dir() {
            return Err(Error::InvalidInput(format!(
                "no records tree under {}",
                src.display()
            )));
        }

        let mut imported = 0;
        let walker = ignore::WalkBuilder::new(&src_records).hidden(true).build();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if path.starts_with(src.join("records/archive")) {
                continue;
            }

            let raw = std::fs::read_to_string(path)?;
            let doc = frontmatter::parse(&raw, &path.display().to_string())?;
            self.import_record(ctx, op, doc).await?;
            imported += 1;
        }
        Ok(imported)
    }

    async fn import_record(&self, ctx: &Principal, op: &OpContext, doc: RecordDoc) -> Result<()> {
        let record_type = RecordType::new(doc.front.record_type.clone());
        self.check_type(&record_type)?;

        let slug = RecordSlug::new(
            doc.front
                .slug
                .clone()
                .ok_or_else(|| Error::InvalidInput("imported record missing slug".into()))?,
        );
        if RecordBmc::slug_taken(&self.mm, &record_type, &slug).await? {
            return Err(Error::SlugConflict {
                record_type: record_type.to_string(),
                slug: slug.to_string(),
            });
        }

        let record_id = RecordId::new(
            doc.front
                .id
                .clone()
                .unwrap_or_else(|| RecordId::mint(&record_type, &slug).to_string()),
        );
        let created = doc.front.created_at.unwrap_or_else(now_ts);
        let updated = doc.front.updated_at.unwrap_or(created);

        let mm = &self.mm;
        let outcome = self.executor.begin(ctx, mm, "record.import", None).await?;
        let mut handle = match outcome {
            BeginOutcome::Replayed(_) => return Ok(()),
            BeginOutcome::Started(h) => h,
        };
        let resource_id = format!("record:{record_id}");
        self.executor
            .acquire_lock(ctx, mm, &mut handle, &resource_id)
            .await?;

        let rel = RecordStore::record_rel_path(&record_type, &slug);
        let run = async {
            let store = mm.record_store().clone();
            let doc_for_write = doc.clone();
            let rel_for_write = rel.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_WRITE_FILE, || {
                    let store = store.clone();
                    let doc = doc_for_write.clone();
                    let rel = rel_for_write.clone();
                    async move {
                        store.write(&rel, &doc)?;
                        Ok(WriteFilePayload { path: rel })
                    }
                })
                .await?;

            let message = format!("import({}): {}", record_type, slug);
            self.commit_step(ctx, mm, &mut handle, vec![rel.clone()], vec![], message)
                .await?;

            let upsert = RecordForUpsert {
                id: record_id.clone(),
                record_type: record_type.clone(),
                slug: slug.clone(),
                title: doc.front.title.clone(),
                status: doc.front.status.clone(),
                author: doc.front.author.clone().unwrap_or_else(|| ctx.username().to_string()),
                path: rel.display().to_string(),
                authors: doc.front.authors.clone(),
                metadata: yaml_mapping_to_json(&doc.front.metadata),
                created_at: created,
                updated_at: updated,
            };
            let upsert_for_step = upsert.clone();
            self.executor
                .step(ctx, mm, &mut handle, STEP_DB_INSERT, || {
                    let upsert = upsert_for_step.clone();
                    async move {
                        RecordBmc::insert(ctx, mm, &upsert).await?;
                        Ok(InsertPayload {
                            id: upsert.id.to_string(),
                        })
                    }
                })
                .await?;

            Ok::<_, Error>(())
        }
        .await;

        match run {
            Ok(()) => {
                self.executor
                    .commit(ctx, mm, handle, &json!({"imported": record_id.as_str()}))
                    .await?;
                self.audit(ctx, op, "record:import.completed", &record_id, "success", None)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -- shared helpers

    /// The commit step, shared by every mutating operation.
    async fn commit_step(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: &mut crate::saga::SagaHandle,
        added: Vec<std::path::PathBuf>,
        removed: Vec<std::path::PathBuf>,
        message: String,
    ) -> Result<String> {
        let (author_name, author_email) = ctx.git_identity();
        let payload = self
            .executor
            .step(ctx, mm, handle, STEP_GIT_COMMIT, || {
                let added = added.clone();
                let removed = removed.clone();
                let message = message.clone();
                let author_name = author_name.clone();
                let author_email = author_email.clone();
                async move {
                    let _git_guard = mm.git_lock.lock().await;
                    let repo = mm.open_repo()?;
                    let oid = git_store::commit_changes(
                        &repo,
                        &added,
                        &removed,
                        &message,
                        &author_name,
                        &author_email,
                    )?;
                    Ok(CommitPayload {
                        oid: oid.to_string(),
                    })
                }
            })
            .await?;
        Ok(payload.oid)
    }

    /// The hook-emission step. Sync handler failures fail the step and
    /// roll the saga back; the emissions themselves are already audited.
    async fn emit_step(
        &self,
        ctx: &Principal,
        op: &OpContext,
        handle: &mut crate::saga::SagaHandle,
        events: Vec<HookEvent>,
    ) -> Result<()> {
        let hooks = self.hooks.clone();
        let source = op.source;
        let dry_run = op.dry_run_hooks.clone();
        let mm = &self.mm;
        self.executor
            .step(ctx, mm, handle, STEP_EMIT_HOOKS, || {
                let hooks = hooks.clone();
                let events = events.clone();
                let dry_run = dry_run.clone();
                async move {
                    for event in events {
                        hooks.emit(ctx, mm, source, event, &dry_run).await?;
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Everything `create` needs before its first side effect.
    async fn prepare_create(
        &self,
        ctx: &Principal,
        record_type: &RecordType,
        input: &RecordInput,
    ) -> Result<CreatePrep> {
        self.storage.check_title(&input.title)?;

        let author = ctx.username().to_string();
        self.check_author_known(ctx, &author).await?;
        let authors = if input.authors.is_empty() {
            vec![frontmatter::AuthorEntry {
                username: author.clone(),
                role: None,
            }]
        } else {
            for entry in &input.authors {
                self.check_author_known(ctx, &entry.username).await?;
            }
            input.authors.clone()
        };

        let slug = self.derive_slug(record_type, &input.title).await?;
        let record_id = RecordId::mint(record_type, &slug);
        let status = self.manifest.default_status.clone();
        let now = now_ts();

        let body = match &input.content {
            Some(c) => c.clone(),
            None => {
                self.templates
                    .render(
                        record_type.as_str(),
                        &json!({
                            "title": input.title,
                            "type": record_type.as_str(),
                            "status": status,
                            "author": author,
                        }),
                    )
                    .await?
            }
        };

        self.storage.check_body(&body)?;

        let metadata = json_to_yaml_mapping(input.metadata.as_ref());
        let doc = RecordDoc {
            front: Frontmatter {
                id: Some(record_id.to_string()),
                title: input.title.clone(),
                record_type: record_type.to_string(),
                status: status.clone(),
                slug: Some(slug.to_string()),
                author: Some(author.clone()),
                authors: authors.clone(),
                created_at: Some(now),
                updated_at: Some(now),
                metadata,
            },
            body,
        };

        Ok(CreatePrep {
            slug,
            record_id,
            status,
            author,
            authors,
            now,
            doc,
        })
    }

    /// Resolves `type/slug` or `records/type/slug.md` to its index row.
    async fn resolve(&self, ctx: &Principal, id_or_path: &str) -> Result<Record> {
        RecordBmc::get(ctx, &self.mm, &RecordId::new(normalize_id(id_or_path))).await
    }

    /// Resolution plus the read gates shared by `get`, `history`, and
    /// `diff`: the role must hold view over the type, and the `public`
    /// role only sees published statuses. A hidden record resolves to
    /// `RecordNotFound`, never to a denial.
    async fn resolve_for_view(&self, ctx: &Principal, id_or_path: &str) -> Result<Record> {
        let record = self.resolve(ctx, id_or_path).await?;
        workflow::can_act(
            &self.workflow,
            ctx.role(),
            Action::View,
            record.record_type.as_str(),
        )?;

        if ctx.role() == "public"
            && !self
                .manifest
                .published_statuses
                .iter()
                .any(|s| s == &record.status)
        {
            return Err(Error::RecordNotFound(id_or_path.to_string()));
        }
        Ok(record)
    }

    /// Row fetch plus content, without role filtering (engine internal).
    async fn get_unchecked(&self, ctx: &Principal, id: &RecordId) -> Result<Record> {
        let mut record = RecordBmc::get(ctx, &self.mm, id).await?;
        let doc = self.mm.record_store().read(Path::new(&record.path))?;
        record.content = doc.body;
        Ok(record)
    }

    fn check_type(&self, record_type: &RecordType) -> Result<()> {
        if self
            .manifest
            .record_types
            .iter()
            .any(|t| t == record_type.as_str())
        {
            Ok(())
        } else {
            Err(Error::UnknownRecordType(record_type.to_string()))
        }
    }

    /// Authors must resolve to known users at write time. The system
    /// principal is exempt: recovery and imports run before users exist.
    async fn check_author_known(&self, ctx: &Principal, username: &str) -> Result<()> {
        if ctx.user_id() == 0 {
            return Ok(());
        }
        if UserBmc::exists(&self.mm, username).await? {
            Ok(())
        } else {
            Err(Error::UserNotFound(username.to_string()))
        }
    }

    /// Probes slug candidates until one is free in both the index and the
    /// tree. An unindexed stray file still blocks its slug.
    async fn derive_slug(&self, record_type: &RecordType, title: &str) -> Result<RecordSlug> {
        let base = slugger::slugify(title);
        if base.is_empty() {
            return Err(Error::InvalidInput(format!(
                "title '{title}' yields an empty slug"
            )));
        }

        for attempt in 0..1000 {
            let candidate = slugger::slug_candidate(&base, attempt);
            let taken_db = RecordBmc::slug_taken(&self.mm, record_type, &candidate).await?;
            let taken_fs = self
                .mm
                .record_store()
                .exists(&RecordStore::record_rel_path(record_type, &candidate));
            if !taken_db && !taken_fs {
                return Ok(candidate);
            }
        }
        Err(Error::SlugConflict {
            record_type: record_type.to_string(),
            slug: base,
        })
    }

    async fn audit(
        &self,
        ctx: &Principal,
        op: &OpContext,
        action: &str,
        record_id: &RecordId,
        result: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let (record_type, _) = record_id
            .as_str()
            .split_once('/')
            .unwrap_or((record_id.as_str(), ""));
        let mut entry = ActivityEntry::now(op.source, ctx.username(), action)
            .with_target(record_type, record_id.as_str())
            .with_result(result);
        if let Some(m) = metadata {
            entry = entry.with_metadata(m);
        }
        if let Err(e) = self.activity.append(ctx, &self.mm, &entry).await {
            warn!(action, error = %e, "activity append failed");
        }
        Ok(())
    }

    fn doc_to_record(
        &self,
        doc: &RecordDoc,
        id: &RecordId,
        record_type: &RecordType,
        slug: &RecordSlug,
    ) -> Record {
        Record {
            id: id.clone(),
            record_type: record_type.clone(),
            slug: slug.clone(),
            title: doc.front.title.clone(),
            status: doc.front.status.clone(),
            author: doc.front.author.clone().unwrap_or_default(),
            path: RecordStore::record_rel_path(record_type, slug)
                .display()
                .to_string(),
            authors: doc.front.authors.clone(),
            content: doc.body.clone(),
            metadata: yaml_mapping_to_json(&doc.front.metadata),
            created_at: doc.front.created_at.unwrap_or_else(now_ts),
            updated_at: doc.front.updated_at.unwrap_or_else(now_ts),
        }
    }
}

struct CreatePrep {
    slug: RecordSlug,
    record_id: RecordId,
    status: String,
    author: String,
    authors: Vec<frontmatter::AuthorEntry>,
    now: NaiveDateTime,
    doc: RecordDoc,
}

/// `records/type/slug.md` and `type/slug` both name the same record.
fn normalize_id(id_or_path: &str) -> String {
    id_or_path
        .strip_prefix("records/")
        .and_then(|s| s.strip_suffix(".md"))
        .unwrap_or(id_or_path)
        .to_string()
}

/// Current time truncated to whole seconds, the precision the stores keep.
fn now_ts() -> NaiveDateTime {
    let now = chrono::Utc::now().naive_utc();
    frontmatter::parse_datetime(&frontmatter::format_datetime(now)).unwrap_or(now)
}

fn later_of(a: NaiveDateTime, b: NaiveDateTime) -> NaiveDateTime {
    if a >= b { a } else { b }
}

/// Shallow-merge: patch keys overwrite, other keys survive.
fn shallow_merge(
    current: &serde_json::Value,
    patch: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut merged = match current {
        serde_json::Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    if let Some(serde_json::Value::Object(patch_map)) = patch {
        for (k, v) in patch_map {
            merged.insert(k.clone(), v.clone());
        }
    }
    serde_json::Value::Object(merged)
}

fn json_to_yaml_mapping(value: Option<&serde_json::Value>) -> serde_yaml::Mapping {
    let Some(value) = value else {
        return serde_yaml::Mapping::new();
    };
    match serde_yaml::to_value(value) {
        Ok(serde_yaml::Value::Mapping(m)) => m,
        _ => serde_yaml::Mapping::new(),
    }
}

fn yaml_mapping_to_json(mapping: &serde_yaml::Mapping) -> serde_json::Value {
    serde_json::to_value(mapping).unwrap_or(serde_json::Value::Object(serde_json::Map::new()))
}

/// Pulls a raw scalar out of the frontmatter block without the tolerant
/// typed parse, for shape validation.
fn raw_frontmatter_value(content: &str, key: &str) -> Option<String> {
    let rest = content.strip_prefix("---\n")?;
    let (yaml_part, _) = rest.split_once("\n---")?;
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(yaml_part).ok()?;
    match mapping.get(serde_yaml::Value::from(key)) {
        Some(serde_yaml::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(serde_yaml::to_string(other).ok()?.trim().to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_shallow_merge() {
        let current = json!({"tags": ["a"], "module": "m"});
        let patch = json!({"tags": ["b"], "version": "2"});
        let merged = shallow_merge(&current, Some(&patch));
        assert_eq!(merged["tags"], json!(["b"]));
        assert_eq!(merged["module"], json!("m"));
        assert_eq!(merged["version"], json!("2"));
    }

    #[test]
    fn test_raw_frontmatter_value() {
        let content = "---\ntitle: T\ncreated_at: not-a-date\n---\n\nbody\n";
        assert_eq!(
            raw_frontmatter_value(content, "created_at"),
            Some("not-a-date".to_string())
        );
        assert_eq!(raw_frontmatter_value(content, "missing"), None);
    }

    #[test]
    fn test_now_ts_round_trips() {
        let now = now_ts();
        let round = frontmatter::parse_datetime(&frontmatter::format_datetime(now)).unwrap();
        assert_eq!(now, round);
    }
}
