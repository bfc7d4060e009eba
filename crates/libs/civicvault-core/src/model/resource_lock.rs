//! TTL-bounded exclusive resource claims.
//!
//! A saga acquires its locks before its first mutating step and releases
//! them on commit or successful rollback. At most one live lock exists per
//! resource; an expired lock is reclaimed by an atomic holder swap rather
//! than a delete, so two claimants racing for a stale lock cannot both win.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::store::frontmatter::DATETIME_FORMAT;
use crate::types::SagaId;
use chrono::{Duration, NaiveDateTime, Utc};

#[derive(Debug, Clone)]
pub struct ResourceLock {
    pub resource_id: String,
    pub holder: SagaId,
    pub acquired_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

/// Backend Model Controller for resource locks.
pub struct ResourceLockBmc;

impl ResourceLockBmc {
    /// Acquires the lock for `holder` or fails with [`Error::LockHeld`].
    ///
    /// Acquisition order:
    /// 1. plain INSERT, which wins when no row exists;
    /// 2. conditional UPDATE swapping the holder, which wins when the existing
    ///    row is expired;
    /// 3. otherwise read the live holder and surface it.
    pub async fn acquire(
        _ctx: &Principal,
        mm: &ModelManager,
        resource_id: &str,
        holder: &SagaId,
        ttl: Duration,
    ) -> Result<()> {
        let db = mm.db();
        let now = Utc::now().naive_utc();
        let now_str = now.format(DATETIME_FORMAT).to_string();
        let expires_str = (now + ttl).format(DATETIME_FORMAT).to_string();

        let stmt = db
            .prepare("INSERT INTO resource_locks (resource_id, holder, acquired_at, expires_at) VALUES (?, ?, ?, ?)")
            .await?;
        match stmt
            .execute((
                resource_id,
                holder.as_str(),
                now_str.as_str(),
                expires_str.as_str(),
            ))
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => {
                // Row exists; fall through to the reclaim path.
            }
            Err(e) => return Err(Error::from(e)),
        }

        // Atomic reclaim: only succeeds against an expired row.
        let stmt = db
            .prepare(
                "UPDATE resource_locks SET holder = ?, acquired_at = ?, expires_at = ?
                 WHERE resource_id = ? AND expires_at < ?",
            )
            .await?;
        let changed = stmt
            .execute((
                holder.as_str(),
                now_str.as_str(),
                expires_str.as_str(),
                resource_id,
                now_str.as_str(),
            ))
            .await?;
        if changed > 0 {
            return Ok(());
        }

        let current = Self::get(mm, resource_id).await?;
        Err(Error::LockHeld {
            resource_id: resource_id.to_string(),
            holder: current
                .map(|l| l.holder.to_string())
                .unwrap_or_else(|| "<released>".to_string()),
        })
    }

    /// Releases a lock, but only for its current holder.
    pub async fn release(
        _ctx: &Principal,
        mm: &ModelManager,
        resource_id: &str,
        holder: &SagaId,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("DELETE FROM resource_locks WHERE resource_id = ? AND holder = ?")
            .await?;
        stmt.execute((resource_id, holder.as_str())).await?;
        Ok(())
    }

    /// Releases every lock a saga holds (commit / successful rollback /
    /// restart recovery).
    pub async fn release_all_for_holder(
        _ctx: &Principal,
        mm: &ModelManager,
        holder: &SagaId,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("DELETE FROM resource_locks WHERE holder = ?")
            .await?;
        stmt.execute([holder.as_str()]).await?;
        Ok(())
    }

    /// Operator drain: force-release a lock parked by a failed saga.
    pub async fn force_release(
        _ctx: &Principal,
        mm: &ModelManager,
        resource_id: &str,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("DELETE FROM resource_locks WHERE resource_id = ?")
            .await?;
        stmt.execute([resource_id]).await?;
        Ok(())
    }

    pub async fn get(mm: &ModelManager, resource_id: &str) -> Result<Option<ResourceLock>> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT resource_id, holder, acquired_at, expires_at
                 FROM resource_locks WHERE resource_id = ?",
            )
            .await?;
        let mut rows = stmt.query([resource_id]).await?;

        if let Some(row) = rows.next().await? {
            let acquired_str: String = row.get(2)?;
            let expires_str: String = row.get(3)?;
            Ok(Some(ResourceLock {
                resource_id: row.get(0)?,
                holder: SagaId::new(row.get::<String>(1)?),
                acquired_at: NaiveDateTime::parse_from_str(&acquired_str, DATETIME_FORMAT)
                    .unwrap_or_default(),
                expires_at: NaiveDateTime::parse_from_str(&expires_str, DATETIME_FORMAT)
                    .unwrap_or_default(),
            }))
        } else {
            Ok(None)
        }
    }
}
