//! Queryable mirror of the activity log.
//!
//! Rows land here after the JSONL file write (see [`crate::activity`]).
//! Queries serve `hook logs` and audit views; the file remains the source
//! of truth.

use crate::Principal;
use crate::error::Result;
use crate::model::ModelManager;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRow {
    pub id: i64,
    pub timestamp: String,
    pub source: String,
    pub actor: String,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub result: String,
    pub metadata: Option<serde_json::Value>,
}

/// Backend Model Controller for activity queries.
pub struct ActivityBmc;

impl ActivityBmc {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        _ctx: &Principal,
        mm: &ModelManager,
        source: &str,
        actor: &str,
        action: &str,
        target_type: Option<&str>,
        target_id: Option<&str>,
        result: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let db = mm.db();
        let stmt = db
            .prepare(
                r#"
            INSERT INTO activity (source, actor, action, target_type, target_id, result, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
            )
            .await?;

        let metadata_str = match metadata {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };

        let mut rows = stmt
            .query((
                source,
                actor,
                action,
                target_type,
                target_id,
                result,
                metadata_str.as_deref(),
            ))
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(row.get(0)?)
        } else {
            Ok(0)
        }
    }

    /// Recent entries, optionally filtered by action prefix
    /// (e.g. `record:` or `hook:`).
    pub async fn list_recent(
        _ctx: &Principal,
        mm: &ModelManager,
        action_prefix: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ActivityRow>> {
        let db = mm.db();

        let (sql, params): (&str, Vec<libsql::Value>) = match action_prefix {
            Some(prefix) => (
                "SELECT id, timestamp, source, actor, action, target_type, target_id, result, metadata
                 FROM activity WHERE action LIKE ? ORDER BY id DESC LIMIT ?",
                vec![format!("{prefix}%").into(), limit.into()],
            ),
            None => (
                "SELECT id, timestamp, source, actor, action, target_type, target_id, result, metadata
                 FROM activity ORDER BY id DESC LIMIT ?",
                vec![limit.into()],
            ),
        };

        let stmt = db.prepare(sql).await?;
        let mut rows = stmt.query(params).await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            let metadata_str: Option<String> = row.get(8)?;
            items.push(ActivityRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                source: row.get(2)?,
                actor: row.get(3)?,
                action: row.get(4)?,
                target_type: row.get::<Option<String>>(5)?,
                target_id: row.get::<Option<String>>(6)?,
                result: row.get(7)?,
                metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
        Ok(items)
    }

    /// Count of entries for one action, used by idempotency assertions.
    pub async fn count_action(_ctx: &Principal, mm: &ModelManager, action: &str) -> Result<i64> {
        let db = mm.db();
        let stmt = db
            .prepare("SELECT COUNT(*) FROM activity WHERE action = ?")
            .await?;
        let mut rows = stmt.query([action]).await?;
        if let Some(row) = rows.next().await? {
            Ok(row.get(0)?)
        } else {
            Ok(0)
        }
    }
}
