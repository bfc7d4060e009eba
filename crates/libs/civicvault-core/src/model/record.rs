//! Record index rows.
//!
//! The database mirrors the records tree for query; the tree owns content.
//! On conflict between the two, the indexing service's policy decides; the
//! BMC itself never reads files.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::store::frontmatter::{AuthorEntry, DATETIME_FORMAT};
use crate::types::{RecordId, RecordSlug, RecordType};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A record as the index database sees it. Content lives on disk and is
/// composed in by the engine on `get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub record_type: RecordType,
    pub slug: RecordSlug,
    pub title: String,
    pub status: String,
    pub author: String,
    /// Repository-relative path of the backing file.
    pub path: String,
    #[serde(default)]
    pub authors: Vec<AuthorEntry>,
    /// Markdown body; empty in list results, filled on `get`.
    #[serde(default)]
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Row shape for inserts and full updates.
#[derive(Debug, Clone)]
pub struct RecordForUpsert {
    pub id: RecordId,
    pub record_type: RecordType,
    pub slug: RecordSlug,
    pub title: String,
    pub status: String,
    pub author: String,
    pub path: String,
    pub authors: Vec<AuthorEntry>,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Query filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub record_type: Option<RecordType>,
    pub status: Option<String>,
    pub author: Option<String>,
    pub tag: Option<String>,
    /// Substring match on the title.
    pub query: Option<String>,
    /// Restrict to these statuses (role filtering for `public`).
    pub visible_statuses: Option<Vec<String>>,
    pub limit: i64,
    pub offset: i64,
}

impl RecordFilter {
    pub fn with_default_page(mut self) -> Self {
        if self.limit <= 0 {
            self.limit = 50;
        }
        self
    }
}

/// One page of list results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Backend Model Controller for record rows.
pub struct RecordBmc;

impl RecordBmc {
    /// Inserts a new record row plus its authors.
    ///
    /// A `(type, slug)` unique violation surfaces as [`Error::SlugConflict`];
    /// the engine probes slugs first, so hitting this means a concurrent
    /// writer won the race.
    pub async fn insert(_ctx: &Principal, mm: &ModelManager, rec: &RecordForUpsert) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                r#"
            INSERT INTO records (id, record_type, slug, title, status, author, path, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .await?;

        let result = stmt
            .execute((
                rec.id.as_str(),
                rec.record_type.as_str(),
                rec.slug.as_str(),
                rec.title.as_str(),
                rec.status.as_str(),
                rec.author.as_str(),
                rec.path.as_str(),
                serde_json::to_string(&rec.metadata)?,
                fmt_ts(rec.created_at),
                fmt_ts(rec.updated_at),
            ))
            .await;

        match result {
            Ok(_) => {}
            Err(e) if e.to_string().contains("UNIQUE") => {
                return Err(Error::SlugConflict {
                    record_type: rec.record_type.to_string(),
                    slug: rec.slug.to_string(),
                });
            }
            Err(e) => return Err(Error::from(e)),
        }

        Self::replace_authors(mm, &rec.id, &rec.authors).await?;
        Ok(())
    }

    /// Full update of an existing row by id.
    pub async fn update(_ctx: &Principal, mm: &ModelManager, rec: &RecordForUpsert) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                r#"
            UPDATE records
            SET title = ?, status = ?, author = ?, path = ?, metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
            )
            .await?;

        let changed = stmt
            .execute((
                rec.title.as_str(),
                rec.status.as_str(),
                rec.author.as_str(),
                rec.path.as_str(),
                serde_json::to_string(&rec.metadata)?,
                fmt_ts(rec.updated_at),
                rec.id.as_str(),
            ))
            .await?;

        if changed == 0 {
            return Err(Error::RecordNotFound(rec.id.to_string()));
        }

        Self::replace_authors(mm, &rec.id, &rec.authors).await?;
        Ok(())
    }

    /// Narrow update used by the sync reconciler and status compensation.
    pub async fn set_status(
        _ctx: &Principal,
        mm: &ModelManager,
        id: &RecordId,
        status: &str,
        updated_at: NaiveDateTime,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("UPDATE records SET status = ?, updated_at = ? WHERE id = ?")
            .await?;
        let changed = stmt
            .execute((status, fmt_ts(updated_at), id.as_str()))
            .await?;
        if changed == 0 {
            return Err(Error::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Removes a row (delete compensation restores via a fresh insert).
    pub async fn delete(_ctx: &Principal, mm: &ModelManager, id: &RecordId) -> Result<()> {
        let db = mm.db();
        let stmt = db.prepare("DELETE FROM records WHERE id = ?").await?;
        let changed = stmt.execute([id.as_str()]).await?;
        if changed == 0 {
            return Err(Error::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get(_ctx: &Principal, mm: &ModelManager, id: &RecordId) -> Result<Record> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!("SELECT {COLUMNS} FROM records WHERE id = ?"))
            .await?;
        let mut rows = stmt.query([id.as_str()]).await?;

        if let Some(row) = rows.next().await? {
            let mut record = Self::from_row(row)?;
            record.authors = Self::authors_of(mm, &record.id).await?;
            Ok(record)
        } else {
            Err(Error::RecordNotFound(id.to_string()))
        }
    }

    pub async fn get_by_type_slug(
        _ctx: &Principal,
        mm: &ModelManager,
        record_type: &RecordType,
        slug: &RecordSlug,
    ) -> Result<Record> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!(
                "SELECT {COLUMNS} FROM records WHERE record_type = ? AND slug = ?"
            ))
            .await?;
        let mut rows = stmt.query([record_type.as_str(), slug.as_str()]).await?;

        if let Some(row) = rows.next().await? {
            let mut record = Self::from_row(row)?;
            record.authors = Self::authors_of(mm, &record.id).await?;
            Ok(record)
        } else {
            Err(Error::RecordNotFound(format!("{record_type}/{slug}")))
        }
    }

    /// True when a `(type, slug)` pair is already indexed.
    pub async fn slug_taken(
        mm: &ModelManager,
        record_type: &RecordType,
        slug: &RecordSlug,
    ) -> Result<bool> {
        let db = mm.db();
        let stmt = db
            .prepare("SELECT 1 FROM records WHERE record_type = ? AND slug = ?")
            .await?;
        let mut rows = stmt.query([record_type.as_str(), slug.as_str()]).await?;
        Ok(rows.next().await?.is_some())
    }

    /// DB-authoritative listing with paging. Filters compose with AND.
    pub async fn list(
        _ctx: &Principal,
        mm: &ModelManager,
        filter: &RecordFilter,
    ) -> Result<Page<Record>> {
        let db = mm.db();

        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();

        if let Some(t) = &filter.record_type {
            conditions.push("record_type = ?".to_string());
            params.push(t.as_str().into());
        }
        if let Some(s) = &filter.status {
            conditions.push("status = ?".to_string());
            params.push(s.as_str().into());
        }
        if let Some(a) = &filter.author {
            conditions.push("author = ?".to_string());
            params.push(a.as_str().into());
        }
        if let Some(tag) = &filter.tag {
            // Tags live in the metadata JSON blob; LIKE keeps the index DB
            // free of a join table at the cost of a scan.
            conditions.push("metadata LIKE ?".to_string());
            params.push(format!("%\"{tag}\"%").into());
        }
        if let Some(q) = &filter.query {
            conditions.push("title LIKE ?".to_string());
            params.push(format!("%{q}%").into());
        }
        if let Some(statuses) = &filter.visible_statuses {
            if statuses.is_empty() {
                return Ok(Page {
                    items: Vec::new(),
                    total: 0,
                    limit: filter.limit,
                    offset: filter.offset,
                });
            }
            let placeholders = vec!["?"; statuses.len()].join(", ");
            conditions.push(format!("status IN ({placeholders})"));
            for s in statuses {
                params.push(s.as_str().into());
            }
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM records {where_clause}");
        let stmt = db.prepare(&count_sql).await?;
        let mut rows = stmt.query(params.clone()).await?;
        let total: i64 = if let Some(row) = rows.next().await? {
            row.get(0)?
        } else {
            0
        };

        let list_sql = format!(
            "SELECT {COLUMNS} FROM records {where_clause} ORDER BY record_type, slug LIMIT ? OFFSET ?"
        );
        params.push(filter.limit.into());
        params.push(filter.offset.into());

        let stmt = db.prepare(&list_sql).await?;
        let mut rows = stmt.query(params).await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(Self::from_row(row)?);
        }

        Ok(Page {
            items,
            total,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    /// Replaces the structured author rows for a record.
    pub async fn replace_authors(
        mm: &ModelManager,
        record_id: &RecordId,
        authors: &[AuthorEntry],
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("DELETE FROM record_authors WHERE record_id = ?")
            .await?;
        stmt.execute([record_id.as_str()]).await?;

        for entry in authors {
            let stmt = db
                .prepare("INSERT INTO record_authors (record_id, username, role) VALUES (?, ?, ?)")
                .await?;
            stmt.execute((
                record_id.as_str(),
                entry.username.as_str(),
                entry.role.as_deref(),
            ))
            .await?;
        }
        Ok(())
    }

    async fn authors_of(mm: &ModelManager, record_id: &RecordId) -> Result<Vec<AuthorEntry>> {
        let db = mm.db();
        let stmt = db
            .prepare("SELECT username, role FROM record_authors WHERE record_id = ? ORDER BY id")
            .await?;
        let mut rows = stmt.query([record_id.as_str()]).await?;

        let mut authors = Vec::new();
        while let Some(row) = rows.next().await? {
            authors.push(AuthorEntry {
                username: row.get(0)?,
                role: row.get::<Option<String>>(1)?,
            });
        }
        Ok(authors)
    }

    fn from_row(row: libsql::Row) -> Result<Record> {
        let metadata_str: String = row.get(7)?;
        let created_at_str: String = row.get(8)?;
        let updated_at_str: String = row.get(9)?;

        Ok(Record {
            id: RecordId::new(row.get::<String>(0)?),
            record_type: RecordType::new(row.get::<String>(1)?),
            slug: RecordSlug::new(row.get::<String>(2)?),
            title: row.get(3)?,
            status: row.get(4)?,
            author: row.get(5)?,
            path: row.get(6)?,
            authors: Vec::new(),
            content: String::new(),
            metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
            created_at: parse_ts(&created_at_str),
            updated_at: parse_ts(&updated_at_str),
        })
    }
}

const COLUMNS: &str =
    "id, record_type, slug, title, status, author, path, metadata, created_at, updated_at";

fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

fn parse_ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).unwrap_or_default()
}
