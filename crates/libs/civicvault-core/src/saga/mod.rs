//! Saga executor: durable multi-step operations with compensation.
//!
//! Every mutating engine operation runs inside a saga. The executor
//! persists each step *before* its do-fn runs, retries transient failures
//! locally with exponential backoff, and on any other failure runs the
//! registered compensations in strict reverse order.
//!
//! Compensation is dispatched through a registry of named [`Compensator`]s
//! keyed by step name. Both in-flight rollback and restart recovery share
//! this path: a step's persisted payload is all a compensator gets, so
//! recovery after a crash needs no live closures.
//!
//! Lock discipline: locks are acquired before the first mutating step and
//! released on commit or successful rollback. A compensation that itself
//! fails parks the saga as `failed` with the lock still held, so divergence
//! is operator-drained rather than silently widened.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::model::resource_lock::ResourceLockBmc;
use crate::model::saga::{SagaBmc, SagaState, StepStatus};
use crate::types::SagaId;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use civicvault_common::config::AppConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Undoes one named step given its persisted payload.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn compensate(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        payload: &serde_json::Value,
    ) -> Result<()>;
}

/// Outcome of [`SagaExecutor::begin`].
pub enum BeginOutcome {
    /// An identical completed saga exists; its recorded result is returned
    /// without re-executing anything.
    Replayed(serde_json::Value),
    /// A fresh saga was persisted and is running.
    Started(SagaHandle),
}

/// Live handle to a running saga.
///
/// Locks are keyed to the saga id in the database, so the handle does not
/// track them; release is a by-holder sweep.
pub struct SagaHandle {
    pub id: SagaId,
    pub name: String,
    seq: i64,
    /// Completed steps in execution order: (seq, name, payload).
    completed: Vec<(i64, String, serde_json::Value)>,
}

#[derive(Clone)]
pub struct SagaExecutor {
    /// Deterministic single-threaded mode: no backoff sleeps, locks fail
    /// fast instead of waiting.
    deterministic: bool,
    step_retries: u32,
    retry_backoff: Duration,
    idempotency_wait: Duration,
    operation_timeout: Duration,
    compensators: Arc<RwLock<HashMap<String, Arc<dyn Compensator>>>>,
}

impl SagaExecutor {
    pub fn new(config: &AppConfig, deterministic: bool) -> Self {
        SagaExecutor {
            deterministic,
            step_retries: config.engine.step_retries,
            retry_backoff: Duration::from_millis(config.engine.retry_backoff_ms),
            idempotency_wait: Duration::from_millis(config.engine.idempotency_wait_ms),
            operation_timeout: Duration::from_secs(config.engine.operation_timeout_secs),
            compensators: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Lock TTL: operation timeout × 2, so a crashed holder's lock becomes
    /// reclaimable soon after its operation could no longer be alive.
    pub fn lock_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds((self.operation_timeout.as_secs() as i64) * 2)
    }

    pub async fn register_compensator(&self, step_name: &str, comp: Arc<dyn Compensator>) {
        self.compensators
            .write()
            .await
            .insert(step_name.to_string(), comp);
    }

    /// Starts a saga, honoring idempotency.
    ///
    /// A completed saga under the same key replays its recorded result. A
    /// still-running one is awaited up to a bounded interval, then the call
    /// fails with `InProgress`.
    pub async fn begin(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        name: &str,
        idempotency_key: Option<&str>,
    ) -> Result<BeginOutcome> {
        if let Some(key) = idempotency_key {
            if let Some(result) = self.await_existing(ctx, mm, key).await? {
                return Ok(BeginOutcome::Replayed(result));
            }
        }

        let saga_id = SagaId::generate();
        SagaBmc::create(ctx, mm, &saga_id, name, idempotency_key).await?;
        info!(saga = %saga_id, name, "saga started");

        Ok(BeginOutcome::Started(SagaHandle {
            id: saga_id,
            name: name.to_string(),
            seq: 0,
            completed: Vec::new(),
        }))
    }

    /// Resolves an existing saga under `key` to its result, waiting out a
    /// running one within the configured bound.
    async fn await_existing(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let poll = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + self.idempotency_wait;

        loop {
            let Some(existing) = SagaBmc::find_by_idempotency_key(ctx, mm, key).await? else {
                return Ok(None);
            };
            match existing.state {
                SagaState::Completed => {
                    return Ok(Some(existing.result.unwrap_or(serde_json::Value::Null)));
                }
                SagaState::Running | SagaState::Pending | SagaState::Compensating => {
                    if self.deterministic || tokio::time::Instant::now() >= deadline {
                        return Err(Error::InProgress {
                            key: key.to_string(),
                        });
                    }
                    tokio::time::sleep(poll).await;
                }
                // A failed saga released its key; the UNIQUE index no
                // longer blocks a retry row.
                SagaState::Failed => return Ok(None),
            }
        }
    }

    /// Acquires a resource lock for the saga, waiting within the operation
    /// timeout unless running deterministically.
    pub async fn acquire_lock(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: &mut SagaHandle,
        resource_id: &str,
    ) -> Result<()> {
        let ttl = self.lock_ttl();
        let poll = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + self.operation_timeout;

        loop {
            match ResourceLockBmc::acquire(ctx, mm, resource_id, &handle.id, ttl).await {
                Ok(()) => return Ok(()),
                Err(e @ Error::LockHeld { .. }) => {
                    if self.deterministic || tokio::time::Instant::now() >= deadline {
                        self.rollback_internal(ctx, mm, handle, "lock acquisition failed")
                            .await?;
                        return Err(e);
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs one step: persist the step row, execute with transient retry,
    /// persist the payload.
    ///
    /// On a non-transient failure the executor rolls the whole saga back
    /// and surfaces a single Operational error naming the failed step.
    pub async fn step<T, F, Fut>(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: &mut SagaHandle,
        name: &str,
        do_fn: F,
    ) -> Result<T>
    where
        T: serde::Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        handle.seq += 1;
        let seq = handle.seq;
        SagaBmc::add_step(ctx, mm, &handle.id, seq, name).await?;

        let mut attempt: u32 = 0;
        let value = loop {
            let run = if self.deterministic {
                do_fn().await
            } else {
                match tokio::time::timeout(self.operation_timeout, do_fn()).await {
                    Ok(r) => r,
                    Err(_) => Err(Error::StepTimeout {
                        step: name.to_string(),
                    }),
                }
            };

            match run {
                Ok(v) => break v,
                Err(e) if e.is_transient() && attempt < self.step_retries => {
                    attempt += 1;
                    warn!(saga = %handle.id, step = name, attempt, error = %e, "transient step error, retrying");
                    if !self.deterministic {
                        tokio::time::sleep(self.retry_backoff * 2u32.pow(attempt - 1)).await;
                    }
                }
                Err(e) => {
                    return Err(self.fail_step(ctx, mm, handle, name, e).await);
                }
            }
        };

        let payload = serde_json::to_value(&value)?;
        SagaBmc::finish_step(ctx, mm, &handle.id, seq, &payload).await?;
        handle.completed.push((seq, name.to_string(), payload));
        Ok(value)
    }

    /// Completes the saga, records the result, and releases its locks.
    pub async fn commit(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: SagaHandle,
        result: &serde_json::Value,
    ) -> Result<()> {
        SagaBmc::complete(ctx, mm, &handle.id, result).await?;
        ResourceLockBmc::release_all_for_holder(ctx, mm, &handle.id).await?;
        info!(saga = %handle.id, "saga committed");
        Ok(())
    }

    /// Explicit rollback of a saga that has not failed a step (used for
    /// cancellation).
    pub async fn rollback(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: SagaHandle,
        reason: &str,
    ) -> Result<()> {
        let mut handle = handle;
        self.rollback_internal(ctx, mm, &mut handle, reason).await
    }

    /// Converts a step failure into the surfaced Operational error, rolling
    /// back first.
    async fn fail_step(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: &mut SagaHandle,
        step: &str,
        cause: Error,
    ) -> Error {
        let reason = format!("step '{step}' failed: {cause}");
        match self.rollback_internal(ctx, mm, handle, &reason).await {
            Ok(()) => Error::StepFailed {
                saga_name: handle.name.clone(),
                step: step.to_string(),
                cause: Box::new(cause),
            },
            // A failed compensation outranks the original failure: partial
            // state is the bigger problem.
            Err(comp_err) => comp_err,
        }
    }

    /// Runs compensations for completed steps in reverse order.
    ///
    /// Success: saga `failed`, locks released. A compensation error: saga
    /// `failed` with the failing step recorded, locks retained.
    async fn rollback_internal(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        handle: &mut SagaHandle,
        reason: &str,
    ) -> Result<()> {
        SagaBmc::set_state(ctx, mm, &handle.id, SagaState::Compensating).await?;

        let compensators = self.compensators.read().await;
        while let Some((seq, step_name, payload)) = handle.completed.pop() {
            if let Some(comp) = compensators.get(&step_name) {
                match comp.compensate(ctx, mm, &payload).await {
                    Ok(()) => {
                        SagaBmc::set_step_status(ctx, mm, &handle.id, seq, StepStatus::Compensated)
                            .await?;
                    }
                    Err(e) => {
                        SagaBmc::set_step_status(
                            ctx,
                            mm,
                            &handle.id,
                            seq,
                            StepStatus::CompensationFailed,
                        )
                        .await?;
                        SagaBmc::fail(
                            ctx,
                            mm,
                            &handle.id,
                            &format!("{reason}; compensation '{step_name}' failed: {e}"),
                        )
                        .await?;
                        // Locks stay held until an operator drains the saga.
                        return Err(Error::CompensationFailed {
                            saga_id: handle.id.to_string(),
                            step: step_name,
                            reason: e.to_string(),
                        });
                    }
                }
            } else {
                // Steps without side effects register no compensator.
                SagaBmc::set_step_status(ctx, mm, &handle.id, seq, StepStatus::Compensated)
                    .await?;
            }
        }

        SagaBmc::fail(ctx, mm, &handle.id, reason).await?;
        ResourceLockBmc::release_all_for_holder(ctx, mm, &handle.id).await?;
        info!(saga = %handle.id, reason, "saga rolled back");
        Ok(())
    }

    /// Restart recovery: compensate every saga left `running` or
    /// `compensating` by a crash, from its last persisted step backwards.
    pub async fn recover(&self, ctx: &Principal, mm: &ModelManager) -> Result<usize> {
        let unfinished = SagaBmc::list_unfinished(ctx, mm).await?;
        let mut recovered = 0;

        for saga in unfinished {
            let steps = SagaBmc::steps_for(ctx, mm, &saga.saga_id).await?;
            let mut handle = SagaHandle {
                id: saga.saga_id.clone(),
                name: saga.name.clone(),
                seq: steps.last().map(|s| s.seq).unwrap_or(0),
                completed: steps
                    .into_iter()
                    .filter(|s| s.status == "done")
                    .map(|s| (s.seq, s.name, s.payload.unwrap_or(serde_json::Value::Null)))
                    .collect(),
            };

            // A saga already compensating skips the state transition check
            // by being re-marked running first.
            if saga.state == SagaState::Compensating {
                SagaBmc::set_state(ctx, mm, &saga.saga_id, SagaState::Running).await?;
            }

            match self
                .rollback_internal(ctx, mm, &mut handle, "recovered after restart")
                .await
            {
                Ok(()) => recovered += 1,
                Err(e) => {
                    warn!(saga = %saga.saga_id, error = %e, "recovery compensation failed; saga parked");
                }
            }
        }

        Ok(recovered)
    }
}
