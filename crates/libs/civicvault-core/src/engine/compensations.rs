//! Step payloads and their compensators.
//!
//! Each mutating saga step serializes a payload describing what it did;
//! the matching [`Compensator`] undoes exactly that from the payload alone.
//! Nothing here captures closures; restart recovery feeds the same
//! payloads back through the same registry.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::model::record::{RecordBmc, RecordForUpsert};
use crate::saga::Compensator;
use crate::store::frontmatter::{self, AuthorEntry};
use crate::store::git_store;
use crate::store::record_store::RecordStore;
use crate::types::{RecordId, RecordSlug, RecordType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

// -- Step names (shared between the engine and compensator registration)

pub const STEP_WRITE_FILE: &str = "record.write_file";
pub const STEP_REWRITE_FILE: &str = "record.rewrite_file";
pub const STEP_ARCHIVE_FILE: &str = "record.archive_file";
pub const STEP_UNARCHIVE_FILE: &str = "record.unarchive_file";
pub const STEP_GIT_COMMIT: &str = "record.git_commit";
pub const STEP_DB_INSERT: &str = "record.db_insert";
pub const STEP_DB_UPDATE: &str = "record.db_update";
pub const STEP_DB_DELETE: &str = "record.db_delete";
pub const STEP_EMIT_HOOKS: &str = "record.emit_hooks";

// -- Payloads

/// A fresh file was written; compensation removes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFilePayload {
    pub path: PathBuf,
}

/// An existing file was overwritten; compensation restores the prior bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteFilePayload {
    pub path: PathBuf,
    pub previous_content: String,
}

/// A file moved to the archive subtree; compensation moves it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveFilePayload {
    pub record_type: String,
    pub slug: String,
}

/// A file moved out of the archive subtree (restore); compensation moves
/// it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnarchiveFilePayload {
    pub record_type: String,
    pub slug: String,
}

/// A commit landed; compensation resets or reverts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    pub oid: String,
}

/// Serializable snapshot of a record row, used to restore the index on
/// rollback of updates and deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSnapshot {
    pub id: String,
    pub record_type: String,
    pub slug: String,
    pub title: String,
    pub status: String,
    pub author: String,
    pub path: String,
    pub authors: Vec<AuthorEntry>,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

impl RowSnapshot {
    pub fn of(record: &crate::model::record::Record) -> Self {
        RowSnapshot {
            id: record.id.to_string(),
            record_type: record.record_type.to_string(),
            slug: record.slug.to_string(),
            title: record.title.clone(),
            status: record.status.clone(),
            author: record.author.clone(),
            path: record.path.clone(),
            authors: record.authors.clone(),
            metadata: record.metadata.clone(),
            created_at: frontmatter::format_datetime(record.created_at),
            updated_at: frontmatter::format_datetime(record.updated_at),
        }
    }

    fn to_upsert(&self) -> Result<RecordForUpsert> {
        let parse = |s: &str| {
            frontmatter::parse_datetime(s)
                .ok_or_else(|| Error::InvalidInput(format!("bad snapshot timestamp: {s}")))
        };
        Ok(RecordForUpsert {
            id: RecordId::new(self.id.clone()),
            record_type: RecordType::new(self.record_type.clone()),
            slug: RecordSlug::new(self.slug.clone()),
            title: self.title.clone(),
            status: self.status.clone(),
            author: self.author.clone(),
            path: self.path.clone(),
            authors: self.authors.clone(),
            metadata: self.metadata.clone(),
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
        })
    }
}

/// An insert happened; compensation deletes the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertPayload {
    pub id: String,
}

/// An update happened; compensation writes the prior snapshot back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub previous: RowSnapshot,
}

/// A delete happened; compensation re-inserts the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePayload {
    pub previous: RowSnapshot,
}

// -- Compensators

pub struct FileWriteComp;

#[async_trait]
impl Compensator for FileWriteComp {
    async fn compensate(
        &self,
        _ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: WriteFilePayload = serde_json::from_value(payload.clone())?;
        let abs = mm.record_store().abs_path(&p.path);
        match std::fs::remove_file(&abs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

pub struct FileRewriteComp;

#[async_trait]
impl Compensator for FileRewriteComp {
    async fn compensate(
        &self,
        _ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: RewriteFilePayload = serde_json::from_value(payload.clone())?;
        let abs = mm.record_store().abs_path(&p.path);
        std::fs::write(&abs, &p.previous_content)?;
        Ok(())
    }
}

pub struct FileArchiveComp;

#[async_trait]
impl Compensator for FileArchiveComp {
    async fn compensate(
        &self,
        _ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: ArchiveFilePayload = serde_json::from_value(payload.clone())?;
        let record_type = RecordType::new(p.record_type);
        let slug = RecordSlug::new(p.slug);
        match mm.record_store().unarchive(&record_type, &slug) {
            Ok(_) => Ok(()),
            // When the commit compensation ran first, its hard reset has
            // already restored the live file and dropped the archived one.
            Err(Error::RecordNotFound(_))
                if mm
                    .record_store()
                    .exists(&RecordStore::record_rel_path(&record_type, &slug)) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

pub struct FileUnarchiveComp;

#[async_trait]
impl Compensator for FileUnarchiveComp {
    async fn compensate(
        &self,
        _ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: UnarchiveFilePayload = serde_json::from_value(payload.clone())?;
        let record_type = RecordType::new(p.record_type);
        let slug = RecordSlug::new(p.slug);
        match mm.record_store().archive(&record_type, &slug) {
            Ok(_) => Ok(()),
            Err(Error::RecordNotFound(_))
                if mm
                    .record_store()
                    .exists(&RecordStore::archive_rel_path(&record_type, &slug)) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

pub struct GitCommitComp;

#[async_trait]
impl Compensator for GitCommitComp {
    async fn compensate(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: CommitPayload = serde_json::from_value(payload.clone())?;
        let oid = git2::Oid::from_str(&p.oid)?;
        let (name, email) = ctx.git_identity();

        let _git_guard = mm.git_lock.lock().await;
        let repo = mm.open_repo()?;
        let reverted = git_store::undo_commit(&repo, oid, &name, &email)?;
        info!(oid = %p.oid, reverted = ?reverted.map(|o| o.to_string()), "commit undone");
        Ok(())
    }
}

pub struct DbInsertComp;

#[async_trait]
impl Compensator for DbInsertComp {
    async fn compensate(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: InsertPayload = serde_json::from_value(payload.clone())?;
        match RecordBmc::delete(ctx, mm, &RecordId::new(p.id)).await {
            Ok(()) | Err(Error::RecordNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct DbUpdateComp;

#[async_trait]
impl Compensator for DbUpdateComp {
    async fn compensate(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: UpdatePayload = serde_json::from_value(payload.clone())?;
        RecordBmc::update(ctx, mm, &p.previous.to_upsert()?).await
    }
}

pub struct DbDeleteComp;

#[async_trait]
impl Compensator for DbDeleteComp {
    async fn compensate(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let p: DeletePayload = serde_json::from_value(payload.clone())?;
        RecordBmc::insert(ctx, mm, &p.previous.to_upsert()?).await
    }
}

/// Helper used by file-mutation steps: the live record path for a payload.
pub fn record_rel_path(record_type: &str, slug: &str) -> PathBuf {
    RecordStore::record_rel_path(&RecordType::new(record_type), &RecordSlug::new(slug))
}
