//! Key-value settings rows.
//!
//! Holds the schema version and small operational flags. Not a dumping
//! ground: anything with structure belongs in `.civic/` configuration.

use crate::Principal;
use crate::error::Result;
use crate::model::ModelManager;

pub struct SettingBmc;

impl SettingBmc {
    pub async fn get(_ctx: &Principal, mm: &ModelManager, key: &str) -> Result<Option<String>> {
        let db = mm.db();
        let stmt = db.prepare("SELECT value FROM settings WHERE key = ?").await?;
        let mut rows = stmt.query([key]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub async fn set(_ctx: &Principal, mm: &ModelManager, key: &str, value: &str) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "INSERT INTO settings (key, value) VALUES (?, ?)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .await?;
        stmt.execute((key, value)).await?;
        Ok(())
    }

    pub async fn all(_ctx: &Principal, mm: &ModelManager) -> Result<Vec<(String, String)>> {
        let db = mm.db();
        let stmt = db.prepare("SELECT key, value FROM settings ORDER BY key").await?;
        let mut rows = stmt.query(()).await?;

        let mut settings = Vec::new();
        while let Some(row) = rows.next().await? {
            settings.push((row.get(0)?, row.get(1)?));
        }
        Ok(settings)
    }
}
