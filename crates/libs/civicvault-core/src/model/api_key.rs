//! API keys for non-interactive callers.
//!
//! The core stores only the key hash; generation and hashing live with the
//! caller, the same division as passwords. Resolving a hash yields a full
//! [`Principal`], so HTTP workers and CI scripts go through the same role
//! checks as everyone else.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::store::frontmatter::DATETIME_FORMAT;
use crate::types::UserId;
use chrono::NaiveDateTime;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: UserId,
    pub label: String,
    pub created_at: NaiveDateTime,
}

pub struct ApiKeyBmc;

impl ApiKeyBmc {
    pub async fn create(
        _ctx: &Principal,
        mm: &ModelManager,
        user_id: UserId,
        key_hash: &str,
        label: &str,
    ) -> Result<i64> {
        let db = mm.db();
        let stmt = db
            .prepare("INSERT INTO api_keys (user_id, key_hash, label) VALUES (?, ?, ?) RETURNING id")
            .await?;
        let mut rows = match stmt.query((user_id.get(), key_hash, label)).await {
            Ok(rows) => rows,
            Err(e) if e.to_string().contains("UNIQUE") => {
                return Err(Error::DuplicateKey {
                    key: "api_key".to_string(),
                });
            }
            Err(e) => return Err(Error::from(e)),
        };

        if let Some(row) = rows.next().await? {
            Ok(row.get(0)?)
        } else {
            Err(Error::InvalidInput("Failed to create api key".into()))
        }
    }

    /// Resolves a key hash to a [`Principal`]. Unknown keys fail with the
    /// same uniform error as bad sessions.
    pub async fn resolve(mm: &ModelManager, key_hash: &str) -> Result<Principal> {
        let db = mm.db();
        let stmt = db
            .prepare(
                r#"
            SELECT u.id, u.username, u.role
            FROM api_keys k JOIN users u ON u.id = k.user_id
            WHERE k.key_hash = ?
            "#,
            )
            .await?;
        let mut rows = stmt.query([key_hash]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Principal::new(
                row.get(0)?,
                row.get::<String>(1)?,
                row.get::<String>(2)?,
            ))
        } else {
            Err(Error::SessionInvalid)
        }
    }

    pub async fn list_for_user(
        _ctx: &Principal,
        mm: &ModelManager,
        user_id: UserId,
    ) -> Result<Vec<ApiKey>> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT id, user_id, label, created_at FROM api_keys WHERE user_id = ? ORDER BY id",
            )
            .await?;
        let mut rows = stmt.query([user_id.get()]).await?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            let created_at_str: String = row.get(3)?;
            keys.push(ApiKey {
                id: row.get(0)?,
                user_id: UserId::new(row.get(1)?),
                label: row.get(2)?,
                created_at: NaiveDateTime::parse_from_str(&created_at_str, DATETIME_FORMAT)
                    .unwrap_or_default(),
            });
        }
        Ok(keys)
    }

    pub async fn revoke(_ctx: &Principal, mm: &ModelManager, id: i64) -> Result<()> {
        let db = mm.db();
        let stmt = db.prepare("DELETE FROM api_keys WHERE id = ?").await?;
        let changed = stmt.execute([id]).await?;
        if changed == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}
