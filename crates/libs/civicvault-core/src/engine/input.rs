//! Operation inputs and the per-call context.

use crate::activity::Source;
use crate::store::frontmatter::AuthorEntry;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Per-operation context carried alongside the principal.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub source: Source,
    /// Event names whose handlers are suppressed for this operation.
    pub dry_run_hooks: Vec<String>,
    /// Suppress human-facing output (callers honor this; the engine only
    /// records it in audit metadata).
    pub silent: bool,
    /// Replay protection for the whole operation.
    pub idempotency_key: Option<String>,
    /// Validate and log intent only; no side effects.
    pub dry_run: bool,
    /// Optimistic concurrency: fail with Conflict when the record's
    /// `updated_at` no longer matches. HTTP callers send it; CLI does not.
    pub expected_updated_at: Option<NaiveDateTime>,
}

impl Default for OpContext {
    fn default() -> Self {
        OpContext {
            source: Source::Cli,
            dry_run_hooks: Vec::new(),
            silent: false,
            idempotency_key: None,
            dry_run: false,
            expected_updated_at: None,
        }
    }
}

impl OpContext {
    pub fn api() -> Self {
        OpContext {
            source: Source::Api,
            ..Default::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_dry_run_hooks(mut self, names: Vec<String>) -> Self {
        self.dry_run_hooks = names;
        self
    }
}

/// Input for `create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordInput {
    pub record_type: String,
    pub title: String,
    /// Markdown body; rendered from the type's template when absent.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Structured contributors; defaults to the principal alone.
    #[serde(default)]
    pub authors: Vec<AuthorEntry>,
}

/// Patch for `update`. Body fully replaces when present; metadata is
/// shallow-merged; absent fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub authors: Option<Vec<AuthorEntry>>,
}

/// Result of `validate`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}
