//! Indexing service: canonical `index.yml` and FS↔DB reconciliation.
//!
//! `generate` scans the records tree and emits a canonical index: entries
//! ordered by (type, slug), stable YAML serialization, malformed records
//! collected under `errors` instead of aborting the run. Generation is
//! idempotent; unchanged records produce byte-identical output, so
//! `generated_at` derives from the newest record rather than the clock.
//!
//! `sync_db` reconciles divergence between frontmatter and index rows under
//! a caller-selected policy. This is the only place the system rewrites a
//! frontmatter field it did not author (`database-wins`).
//!
//! Construction is pure; the engine handle is attached afterwards and only
//! deepens validation; everything else works without it.

use crate::Principal;
use crate::activity::{ActivityEntry, ActivityLog, Source};
use crate::engine::RecordEngine;
use crate::error::{Error, Result};
use crate::hooks::{EventKind, HookBus, HookEvent};
use crate::model::ModelManager;
use crate::model::record::{RecordBmc, RecordFilter, RecordForUpsert};
use crate::store::frontmatter::{self, RecordDoc};
use crate::store::record_store::RecordStore;
use crate::types::{RecordId, RecordSlug, RecordType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// The four reconciliation policies. The set is authoritative; anything
/// else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    FileWins,
    DatabaseWins,
    Timestamp,
    Manual,
}

impl ConflictPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "file-wins" => Ok(ConflictPolicy::FileWins),
            "database-wins" => Ok(ConflictPolicy::DatabaseWins),
            "timestamp" => Ok(ConflictPolicy::Timestamp),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution policy: {other} (expected file-wins, database-wins, timestamp, manual)"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::FileWins => "file-wins",
            ConflictPolicy::DatabaseWins => "database-wins",
            ConflictPolicy::Timestamp => "timestamp",
            ConflictPolicy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntryMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub file: String,
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub status: String,
    pub title: String,
    pub author: String,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: IndexEntryMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMetadata {
    #[serde(rename = "totalRecords")]
    pub total_records: usize,
    pub types: Vec<String>,
    pub modules: Vec<String>,
    pub generated_at: String,
    pub generator_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CivicIndex {
    pub entries: Vec<IndexEntry>,
    pub metadata: IndexMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Outcome of one `sync_db` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub rows_updated: usize,
    pub rows_inserted: usize,
    pub rows_deleted: usize,
    pub files_rewritten: usize,
    pub conflicts: usize,
}

#[derive(Clone)]
pub struct IndexingService {
    mm: ModelManager,
    hooks: HookBus,
    activity: ActivityLog,
    engine: Arc<OnceLock<RecordEngine>>,
}

impl IndexingService {
    /// Constructor-pure: needs only the stores and buses.
    pub fn new(mm: ModelManager, hooks: HookBus, activity: ActivityLog) -> Self {
        IndexingService {
            mm,
            hooks,
            activity,
            engine: Arc::new(OnceLock::new()),
        }
    }

    /// Attaches the engine after construction; deepens per-record
    /// validation during `generate`.
    pub fn attach_engine(&self, engine: RecordEngine) {
        let _ = self.engine.set(engine);
    }

    /// Builds the canonical index and writes `records/index.yml`.
    ///
    /// Returns the index; the file write is skipped when the bytes are
    /// unchanged, keeping repeated runs free of mtime churn.
    pub async fn generate(&self, ctx: &Principal) -> Result<CivicIndex> {
        let store = self.mm.record_store();
        let paths = store.list(None)?;

        let mut entries = Vec::new();
        let mut errors = Vec::new();

        for rel in &paths {
            let raw = match store.read_raw(rel) {
                Ok(r) => r,
                Err(e) => {
                    errors.push(format!("{}: {e}", rel.display()));
                    continue;
                }
            };
            let doc = match frontmatter::parse(&raw, &rel.display().to_string()) {
                Ok(d) => d,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };

            if let Some(engine) = self.engine.get() {
                let report = engine
                    .validate_content(ctx, &raw, &rel.display().to_string())
                    .await?;
                if !report.valid {
                    for err in report.errors {
                        errors.push(format!("{}: {err}", rel.display()));
                    }
                }
            }

            entries.push(entry_from_doc(rel, &doc));
        }

        entries.sort_by(|a, b| {
            (a.record_type.as_str(), a.metadata.slug.as_str())
                .cmp(&(b.record_type.as_str(), b.metadata.slug.as_str()))
        });

        let types: Vec<String> = entries
            .iter()
            .map(|e| e.record_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let modules: Vec<String> = entries
            .iter()
            .filter_map(|e| e.metadata.module.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        // Newest record timestamp, not the wall clock: regeneration with no
        // changes must be byte-identical.
        let generated_at = entries
            .iter()
            .map(|e| e.updated_at.clone())
            .max()
            .unwrap_or_else(|| "1970-01-01 00:00:00".to_string());

        let index = CivicIndex {
            metadata: IndexMetadata {
                total_records: entries.len(),
                types,
                modules,
                generated_at,
                generator_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            entries,
            errors,
        };

        self.write_if_changed(&index)?;
        Ok(index)
    }

    fn write_if_changed(&self, index: &CivicIndex) -> Result<()> {
        let serialized = serde_yaml::to_string(index)?;
        let target = self.mm.data_dir.join("records").join("index.yml");

        if let Ok(existing) = std::fs::read_to_string(&target) {
            if existing == serialized {
                return Ok(());
            }
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = target.with_extension("yml.tmp");
        std::fs::write(&tmp, &serialized)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Reconciles index rows with the records tree under `policy`.
    pub async fn sync_db(&self, ctx: &Principal, policy: ConflictPolicy) -> Result<SyncReport> {
        let store = self.mm.record_store();
        let paths = store.list(None)?;
        let mut report = SyncReport::default();
        let mut seen_ids: BTreeSet<String> = BTreeSet::new();

        for rel in &paths {
            report.scanned += 1;
            let doc = match store.read(rel) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let Some(upsert) = upsert_from_doc(rel, &doc, ctx) else {
                continue;
            };
            seen_ids.insert(upsert.id.to_string());

            match RecordBmc::get(ctx, &self.mm, &upsert.id).await {
                Err(Error::RecordNotFound(_)) => {
                    RecordBmc::insert(ctx, &self.mm, &upsert).await?;
                    report.rows_inserted += 1;
                }
                Err(e) => return Err(e),
                Ok(row) => {
                    if !row_differs(&row, &upsert) {
                        continue;
                    }
                    let effective = match policy {
                        ConflictPolicy::Timestamp => {
                            // Newer updated_at wins; exact tie goes to the file.
                            if row.updated_at > upsert.updated_at {
                                ConflictPolicy::DatabaseWins
                            } else {
                                ConflictPolicy::FileWins
                            }
                        }
                        p => p,
                    };

                    match effective {
                        ConflictPolicy::FileWins => {
                            RecordBmc::update(ctx, &self.mm, &upsert).await?;
                            report.rows_updated += 1;
                            self.audit_conflict(ctx, &upsert.id, "file-wins").await?;
                        }
                        ConflictPolicy::DatabaseWins => {
                            let mut rewritten = doc.clone();
                            rewritten.front.title = row.title.clone();
                            rewritten.front.status = row.status.clone();
                            rewritten.front.author = Some(row.author.clone());
                            rewritten.front.updated_at = Some(row.updated_at);
                            rewritten.front.metadata = yaml_from_json(&row.metadata);
                            store.write(rel, &rewritten)?;
                            report.files_rewritten += 1;
                            self.audit_conflict(ctx, &row.id, "database-wins").await?;
                        }
                        ConflictPolicy::Manual => {
                            report.conflicts += 1;
                            let payload = json!({
                                "id": upsert.id.as_str(),
                                "file_status": upsert.status,
                                "db_status": row.status,
                            });
                            self.hooks
                                .emit(
                                    ctx,
                                    &self.mm,
                                    Source::Workflow,
                                    HookEvent::new(EventKind::RecordSyncConflict, payload),
                                    &[],
                                )
                                .await?;
                            let entry = ActivityEntry::now(
                                Source::Workflow,
                                ctx.username(),
                                "sync.conflict_detected",
                            )
                            .with_target(upsert.record_type.as_str(), upsert.id.as_str());
                            self.activity.append(ctx, &self.mm, &entry).await?;
                        }
                        ConflictPolicy::Timestamp => unreachable!("resolved above"),
                    }
                }
            }
        }

        // Rows whose backing file is gone.
        let all_rows = RecordBmc::list(
            ctx,
            &self.mm,
            &RecordFilter {
                limit: i64::MAX,
                ..Default::default()
            },
        )
        .await?;
        for row in all_rows.items {
            if seen_ids.contains(row.id.as_str()) {
                continue;
            }
            match policy {
                ConflictPolicy::FileWins => {
                    RecordBmc::delete(ctx, &self.mm, &row.id).await?;
                    report.rows_deleted += 1;
                    self.audit_conflict(ctx, &row.id, "file-wins").await?;
                }
                ConflictPolicy::DatabaseWins => {
                    // Recreate the file from the row.
                    let rel = RecordStore::record_rel_path(&row.record_type, &row.slug);
                    let doc = RecordDoc {
                        front: frontmatter::Frontmatter {
                            id: Some(row.id.to_string()),
                            title: row.title.clone(),
                            record_type: row.record_type.to_string(),
                            status: row.status.clone(),
                            slug: Some(row.slug.to_string()),
                            author: Some(row.author.clone()),
                            authors: Vec::new(),
                            created_at: Some(row.created_at),
                            updated_at: Some(row.updated_at),
                            metadata: yaml_from_json(&row.metadata),
                        },
                        body: String::new(),
                    };
                    store.write(&rel, &doc)?;
                    report.files_rewritten += 1;
                    self.audit_conflict(ctx, &row.id, "database-wins").await?;
                }
                ConflictPolicy::Manual => {
                    report.conflicts += 1;
                    let payload = json!({
                        "id": row.id.as_str(),
                        "file_status": null,
                        "db_status": row.status,
                    });
                    self.hooks
                        .emit(
                            ctx,
                            &self.mm,
                            Source::Workflow,
                            HookEvent::new(EventKind::RecordSyncConflict, payload),
                            &[],
                        )
                        .await?;
                    let entry = ActivityEntry::now(
                        Source::Workflow,
                        ctx.username(),
                        "sync.conflict_detected",
                    )
                    .with_target(row.record_type.as_str(), row.id.as_str());
                    self.activity.append(ctx, &self.mm, &entry).await?;
                }
                ConflictPolicy::Timestamp => {
                    report.conflicts += 1;
                    let entry = ActivityEntry::now(
                        Source::Workflow,
                        ctx.username(),
                        "sync.conflict_detected",
                    )
                    .with_target(row.record_type.as_str(), row.id.as_str());
                    self.activity.append(ctx, &self.mm, &entry).await?;
                }
            }
        }

        info!(?policy, scanned = report.scanned, "index sync finished");
        Ok(report)
    }

    async fn audit_conflict(&self, ctx: &Principal, id: &RecordId, resolution: &str) -> Result<()> {
        let (record_type, _) = id.as_str().split_once('/').unwrap_or((id.as_str(), ""));
        let entry = ActivityEntry::now(Source::Workflow, ctx.username(), "sync.conflict_resolved")
            .with_target(record_type, id.as_str())
            .with_metadata(json!({"resolution": resolution}));
        self.activity.append(ctx, &self.mm, &entry).await
    }
}

fn entry_from_doc(rel: &Path, doc: &RecordDoc) -> IndexEntry {
    let front = &doc.front;
    let slug = front.slug.clone().unwrap_or_else(|| {
        rel.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let id = front
        .id
        .clone()
        .unwrap_or_else(|| format!("{}/{}", front.record_type, slug));

    let tags = front
        .metadata
        .get(serde_yaml::Value::from("tags"))
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let module = front
        .metadata
        .get(serde_yaml::Value::from("module"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let version = front
        .metadata
        .get(serde_yaml::Value::from("version"))
        .and_then(|v| v.as_str())
        .map(String::from);

    IndexEntry {
        file: rel.display().to_string(),
        id,
        record_type: front.record_type.clone(),
        status: front.status.clone(),
        title: front.title.clone(),
        author: front.author.clone().unwrap_or_default(),
        created_at: front
            .created_at
            .map(frontmatter::format_datetime)
            .unwrap_or_default(),
        updated_at: front
            .updated_at
            .map(frontmatter::format_datetime)
            .unwrap_or_default(),
        metadata: IndexEntryMetadata {
            tags,
            module,
            slug,
            version,
        },
    }
}

fn upsert_from_doc(rel: &Path, doc: &RecordDoc, ctx: &Principal) -> Option<RecordForUpsert> {
    let front = &doc.front;
    if front.record_type.is_empty() {
        return None;
    }
    let slug = front.slug.clone().or_else(|| {
        rel.file_stem().map(|s| s.to_string_lossy().into_owned())
    })?;
    let id = front
        .id
        .clone()
        .unwrap_or_else(|| format!("{}/{}", front.record_type, slug));
    let created_at = front.created_at?;

    Some(RecordForUpsert {
        id: RecordId::new(id),
        record_type: RecordType::new(front.record_type.clone()),
        slug: RecordSlug::new(slug),
        title: front.title.clone(),
        status: front.status.clone(),
        author: front
            .author
            .clone()
            .unwrap_or_else(|| ctx.username().to_string()),
        path: rel.display().to_string(),
        authors: front.authors.clone(),
        metadata: serde_json::to_value(&front.metadata).unwrap_or(json!({})),
        created_at,
        updated_at: front.updated_at.unwrap_or(created_at),
    })
}

fn row_differs(row: &crate::model::record::Record, upsert: &RecordForUpsert) -> bool {
    row.title != upsert.title
        || row.status != upsert.status
        || row.author != upsert.author
        || row.updated_at != upsert.updated_at
}

fn yaml_from_json(value: &serde_json::Value) -> serde_yaml::Mapping {
    match serde_yaml::to_value(value) {
        Ok(serde_yaml::Value::Mapping(m)) => m,
        _ => serde_yaml::Mapping::new(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_policy_parse_authoritative_set() {
        assert_eq!(
            ConflictPolicy::parse("file-wins").unwrap(),
            ConflictPolicy::FileWins
        );
        assert_eq!(
            ConflictPolicy::parse("database-wins").unwrap(),
            ConflictPolicy::DatabaseWins
        );
        assert_eq!(
            ConflictPolicy::parse("timestamp").unwrap(),
            ConflictPolicy::Timestamp
        );
        assert_eq!(ConflictPolicy::parse("manual").unwrap(), ConflictPolicy::Manual);
        assert!(ConflictPolicy::parse("merge").is_err());
        assert!(ConflictPolicy::parse("").is_err());
    }

    #[test]
    fn test_entry_from_doc_falls_back_to_file_stem() {
        let doc = frontmatter::parse(
            "---\ntitle: T\ntype: bylaw\nstatus: draft\n---\n",
            "records/bylaw/implied-slug.md",
        )
        .unwrap();
        let entry = entry_from_doc(Path::new("records/bylaw/implied-slug.md"), &doc);
        assert_eq!(entry.metadata.slug, "implied-slug");
        assert_eq!(entry.id, "bylaw/implied-slug");
    }
}
