//! Typed event bus with audit-first dispatch.
//!
//! The engine emits events; subscribers react. Two guarantees order the
//! world for auditors:
//!
//! 1. Every emission is appended to the activity log *before* any handler
//!    runs; a crashed handler still leaves the intent on record.
//! 2. A `sync` handler's failure propagates into the emitting saga step;
//!    `async` handler failures are logged and retried per their options and
//!    never fail the operation.
//!
//! Dry-run suppresses handlers per event name: a suppressed handler is not
//! scheduled at all, so it cannot emit downstream events. The audit entry
//! records the suppression.

pub mod config;

pub use config::HooksConfig;

use crate::Principal;
use crate::activity::{ActivityEntry, ActivityLog, Source};
use crate::error::{Error, Result};
use crate::model::ModelManager;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, warn};

/// The closed set of event names the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CivicInitialized,
    RecordCreated,
    RecordUpdated,
    RecordStatusChanged,
    RecordDeleted,
    RecordCommitted,
    RecordSyncConflict,
    WorkflowTransition,
    AuthLogin,
    AuthRoleChanged,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CivicInitialized => "civic:initialized",
            EventKind::RecordCreated => "record:created",
            EventKind::RecordUpdated => "record:updated",
            EventKind::RecordStatusChanged => "record:status-changed",
            EventKind::RecordDeleted => "record:deleted",
            EventKind::RecordCommitted => "record:committed",
            EventKind::RecordSyncConflict => "record:sync-conflict",
            EventKind::WorkflowTransition => "workflow:transition",
            EventKind::AuthLogin => "auth:login",
            EventKind::AuthRoleChanged => "auth:role-changed",
        }
    }
}

/// An emitted event: kind plus JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct HookEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl HookEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        HookEvent {
            name: kind.as_str().to_string(),
            payload,
        }
    }
}

/// Subscriber callback.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent) -> Result<()>;
}

/// How a subscription participates in the emitting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Awaited before the owning saga step completes; errors propagate.
    Sync,
    /// Detached; errors are logged and retried.
    Async,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub mode: DispatchMode,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            mode: DispatchMode::Sync,
            timeout: Duration::from_secs(10),
            retries: 0,
        }
    }
}

struct Subscription {
    pattern: String,
    handler: Arc<dyn HookHandler>,
    options: SubscribeOptions,
}

/// `record:*` and `*` wildcards; otherwise exact match.
fn pattern_matches(pattern: &str, event_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return event_name.starts_with(prefix);
    }
    pattern == event_name
}

/// The event bus.
#[derive(Clone)]
pub struct HookBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    activity: ActivityLog,
    config: Arc<RwLock<HooksConfig>>,
}

impl HookBus {
    pub fn new(activity: ActivityLog, config: HooksConfig) -> Self {
        HookBus {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            activity,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn HookHandler>,
        options: SubscribeOptions,
    ) {
        self.subscriptions.write().await.push(Subscription {
            pattern: pattern.into(),
            handler,
            options,
        });
    }

    pub async fn set_enabled(&self, event_name: &str, enabled: bool) {
        self.config.write().await.set_enabled(event_name, enabled);
    }

    /// Snapshot of the current enablement and bindings.
    pub async fn config(&self) -> HooksConfig {
        self.config.read().await.clone()
    }

    /// Emits an event.
    ///
    /// `dry_run` lists event names whose handlers must be suppressed for
    /// this operation. The audit entry always lands first.
    pub async fn emit(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        source: Source,
        event: HookEvent,
        dry_run: &[String],
    ) -> Result<()> {
        let suppressed = dry_run.iter().any(|n| n == &event.name);
        let enabled = self.config.read().await.is_enabled(&event.name);

        let audit_result = if suppressed {
            "dry-run"
        } else if !enabled {
            "disabled"
        } else {
            "emitted"
        };

        let entry = ActivityEntry::now(source, ctx.username(), &format!("hook:{}", event.name))
            .with_result(audit_result)
            .with_metadata(event.payload.clone());
        self.activity.append(ctx, mm, &entry).await?;

        if suppressed || !enabled {
            return Ok(());
        }

        let subscriptions = self.subscriptions.read().await;
        for sub in subscriptions
            .iter()
            .filter(|s| pattern_matches(&s.pattern, &event.name))
        {
            match sub.options.mode {
                DispatchMode::Sync => {
                    let run = tokio::time::timeout(sub.options.timeout, sub.handler.handle(&event));
                    match run.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(event = %event.name, error = %e, "sync hook handler failed");
                            return Err(Error::HookHandler {
                                event: event.name.clone(),
                                reason: e.to_string(),
                            });
                        }
                        Err(_) => {
                            error!(event = %event.name, "sync hook handler timed out");
                            return Err(Error::HookHandler {
                                event: event.name.clone(),
                                reason: "timed out".to_string(),
                            });
                        }
                    }
                }
                DispatchMode::Async => {
                    let handler = sub.handler.clone();
                    let options = sub.options.clone();
                    let event = event.clone();
                    tokio::spawn(async move {
                        let mut attempt = 0;
                        loop {
                            let run =
                                tokio::time::timeout(options.timeout, handler.handle(&event)).await;
                            match run {
                                Ok(Ok(())) => return,
                                Ok(Err(e)) if attempt < options.retries => {
                                    warn!(event = %event.name, attempt, error = %e, "async hook retry");
                                }
                                Ok(Err(e)) => {
                                    error!(event = %event.name, error = %e, "async hook handler failed");
                                    return;
                                }
                                Err(_) if attempt < options.retries => {
                                    warn!(event = %event.name, attempt, "async hook timeout, retrying");
                                }
                                Err(_) => {
                                    error!(event = %event.name, "async hook handler timed out");
                                    return;
                                }
                            }
                            attempt += 1;
                        }
                    });
                }
            }
        }

        Ok(())
    }
}
