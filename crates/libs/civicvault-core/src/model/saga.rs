//! Saga and step persistence.
//!
//! Rows here are written by the executor, never by operation code directly.
//! State invariants enforced at this layer: a `completed` saga is immutable,
//! and `compensating` may only be entered from `running`.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::store::frontmatter::DATETIME_FORMAT;
use crate::types::SagaId;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Saga lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaState {
    Pending,
    Running,
    Compensating,
    Completed,
    Failed,
}

impl SagaState {
    pub fn as_str(self) -> &'static str {
        match self {
            SagaState::Pending => "pending",
            SagaState::Running => "running",
            SagaState::Compensating => "compensating",
            SagaState::Completed => "completed",
            SagaState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SagaState::Pending),
            "running" => Ok(SagaState::Running),
            "compensating" => Ok(SagaState::Compensating),
            "completed" => Ok(SagaState::Completed),
            "failed" => Ok(SagaState::Failed),
            other => Err(Error::InvalidInput(format!("unknown saga state: {other}"))),
        }
    }
}

/// Step status within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Done,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Done => "done",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub name: String,
    pub state: SagaState,
    pub idempotency_key: Option<String>,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct SagaStepRecord {
    pub saga_id: SagaId,
    pub seq: i64,
    pub name: String,
    pub status: String,
    pub payload: Option<serde_json::Value>,
    pub compensation_payload: Option<serde_json::Value>,
}

/// Backend Model Controller for saga persistence.
pub struct SagaBmc;

impl SagaBmc {
    pub async fn create(
        _ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        name: &str,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("INSERT INTO sagas (saga_id, name, state, idempotency_key) VALUES (?, ?, 'running', ?)")
            .await?;
        match stmt
            .execute((saga_id.as_str(), name, idempotency_key))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(Error::InProgress {
                key: idempotency_key.unwrap_or("<none>").to_string(),
            }),
            Err(e) => Err(Error::from(e)),
        }
    }

    pub async fn get(_ctx: &Principal, mm: &ModelManager, saga_id: &SagaId) -> Result<SagaRecord> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!("SELECT {COLUMNS} FROM sagas WHERE saga_id = ?"))
            .await?;
        let mut rows = stmt.query([saga_id.as_str()]).await?;
        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            Err(Error::SagaNotFound(saga_id.to_string()))
        }
    }

    pub async fn find_by_idempotency_key(
        _ctx: &Principal,
        mm: &ModelManager,
        key: &str,
    ) -> Result<Option<SagaRecord>> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!(
                "SELECT {COLUMNS} FROM sagas WHERE idempotency_key = ?"
            ))
            .await?;
        let mut rows = stmt.query([key]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(Self::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Transitions saga state, enforcing the lifecycle invariants.
    pub async fn set_state(
        ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        state: SagaState,
    ) -> Result<()> {
        let current = Self::get(ctx, mm, saga_id).await?;

        if current.state == SagaState::Completed {
            return Err(Error::InvalidInput(format!(
                "saga {saga_id} is completed and immutable"
            )));
        }
        if state == SagaState::Compensating && current.state != SagaState::Running {
            return Err(Error::InvalidInput(format!(
                "saga {saga_id} cannot compensate from state '{}'",
                current.state.as_str()
            )));
        }

        let db = mm.db();
        let stmt = db
            .prepare("UPDATE sagas SET state = ?, updated_at = CURRENT_TIMESTAMP WHERE saga_id = ?")
            .await?;
        stmt.execute((state.as_str(), saga_id.as_str())).await?;
        Ok(())
    }

    /// Records the result payload and marks the saga completed.
    pub async fn complete(
        ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        result: &serde_json::Value,
    ) -> Result<()> {
        let current = Self::get(ctx, mm, saga_id).await?;
        if current.state == SagaState::Completed {
            return Err(Error::InvalidInput(format!(
                "saga {saga_id} is completed and immutable"
            )));
        }

        let db = mm.db();
        let stmt = db
            .prepare("UPDATE sagas SET state = 'completed', result = ?, updated_at = CURRENT_TIMESTAMP WHERE saga_id = ?")
            .await?;
        stmt.execute((serde_json::to_string(result)?, saga_id.as_str()))
            .await?;
        Ok(())
    }

    /// Marks the saga failed. The idempotency key is released so a caller
    /// may retry the operation under the same key.
    pub async fn fail(
        _ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        reason: &str,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("UPDATE sagas SET state = 'failed', failure_reason = ?, idempotency_key = NULL, updated_at = CURRENT_TIMESTAMP WHERE saga_id = ?")
            .await?;
        stmt.execute((reason, saga_id.as_str())).await?;
        Ok(())
    }

    /// Persists a step row *before* its do-fn runs.
    pub async fn add_step(
        _ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        seq: i64,
        name: &str,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("INSERT INTO saga_steps (saga_id, seq, name, status) VALUES (?, ?, ?, 'pending')")
            .await?;
        stmt.execute((saga_id.as_str(), seq, name)).await?;
        Ok(())
    }

    /// Marks a step done and stores its payload for later compensation.
    pub async fn finish_step(
        _ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        seq: i64,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("UPDATE saga_steps SET status = 'done', payload = ? WHERE saga_id = ? AND seq = ?")
            .await?;
        stmt.execute((serde_json::to_string(payload)?, saga_id.as_str(), seq))
            .await?;
        Ok(())
    }

    pub async fn set_step_status(
        _ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
        seq: i64,
        status: StepStatus,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("UPDATE saga_steps SET status = ? WHERE saga_id = ? AND seq = ?")
            .await?;
        stmt.execute((status.as_str(), saga_id.as_str(), seq))
            .await?;
        Ok(())
    }

    /// Steps of a saga in execution order.
    pub async fn steps_for(
        _ctx: &Principal,
        mm: &ModelManager,
        saga_id: &SagaId,
    ) -> Result<Vec<SagaStepRecord>> {
        let db = mm.db();
        let stmt = db
            .prepare(
                "SELECT saga_id, seq, name, status, payload, compensation_payload
                 FROM saga_steps WHERE saga_id = ? ORDER BY seq",
            )
            .await?;
        let mut rows = stmt.query([saga_id.as_str()]).await?;

        let mut steps = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload_str: Option<String> = row.get(4)?;
            let comp_str: Option<String> = row.get(5)?;
            steps.push(SagaStepRecord {
                saga_id: SagaId::new(row.get::<String>(0)?),
                seq: row.get(1)?,
                name: row.get(2)?,
                status: row.get(3)?,
                payload: payload_str.and_then(|s| serde_json::from_str(&s).ok()),
                compensation_payload: comp_str.and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
        Ok(steps)
    }

    /// Sagas interrupted by a crash: still `running` or `compensating`.
    pub async fn list_unfinished(_ctx: &Principal, mm: &ModelManager) -> Result<Vec<SagaRecord>> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!(
                "SELECT {COLUMNS} FROM sagas WHERE state IN ('running', 'compensating') ORDER BY created_at"
            ))
            .await?;
        let mut rows = stmt.query(()).await?;

        let mut sagas = Vec::new();
        while let Some(row) = rows.next().await? {
            sagas.push(Self::from_row(row)?);
        }
        Ok(sagas)
    }

    fn from_row(row: libsql::Row) -> Result<SagaRecord> {
        let state_str: String = row.get(2)?;
        let result_str: Option<String> = row.get(4)?;
        let created_at_str: String = row.get(6)?;
        let updated_at_str: String = row.get(7)?;

        Ok(SagaRecord {
            saga_id: SagaId::new(row.get::<String>(0)?),
            name: row.get(1)?,
            state: SagaState::parse(&state_str)?,
            idempotency_key: row.get::<Option<String>>(3)?,
            result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
            failure_reason: row.get::<Option<String>>(5)?,
            created_at: NaiveDateTime::parse_from_str(&created_at_str, DATETIME_FORMAT)
                .unwrap_or_default(),
            updated_at: NaiveDateTime::parse_from_str(&updated_at_str, DATETIME_FORMAT)
                .unwrap_or_default(),
        })
    }
}

const COLUMNS: &str =
    "saga_id, name, state, idempotency_key, result, failure_reason, created_at, updated_at";
