//! Error types for record engine operations.
//!
//! One enum covers every failure the engine can surface. Callers that need
//! coarse handling (exit codes, HTTP status mapping, retry decisions) use
//! [`Error::kind`], which buckets each variant into the seven-way
//! [`ErrorKind`] taxonomy. Errors are values: nothing in this crate throws
//! for control flow.

use strum_macros::AsRefStr;
use thiserror::Error;

/// Coarse classification of an [`Error`].
///
/// - `Validation`: malformed input, surfaced with field detail, never retried
/// - `Authorization`: denial, uniform on purpose, no field detail
/// - `Conflict`: carries the conflicting key; caller chooses resolution
/// - `NotFound`: record, user, saga, or lock missing
/// - `Transient`: retried inside a saga step with backoff
/// - `Operational`: a step failure that triggered compensation
/// - `Fatal`: the process refuses writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    NotFound,
    Transient,
    Operational,
    Fatal,
}

/// The error type for record engine operations.
#[derive(Debug, Error, AsRefStr)]
pub enum Error {
    // -- External errors from dependencies
    /// Database error from libsql.
    #[error("Libsql Error: {0}")]
    Libsql(#[from] libsql::Error),

    /// Git repository error.
    #[error("Git Error: {0}")]
    Git2(#[from] git2::Error),

    /// JSON serialization/deserialization error.
    #[error("Serde JSON Error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("Serde YAML Error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    /// Standard I/O error.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Template rendering error.
    #[error("Template Error: {0}")]
    Template(#[from] minijinja::Error),

    // -- Validation
    /// Input validation error with no structured field detail.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Structured validation error with field, reason, and suggestion.
    #[error("Validation error: {0}")]
    Validation(#[from] crate::utils::validation::ValidationError),

    /// Record type is not in the configured set.
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    /// Status is not in the configured status set.
    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    /// Frontmatter could not be parsed from a record file.
    #[error("Invalid frontmatter in {path}: {reason}")]
    InvalidFrontmatter { path: String, reason: String },

    // -- Authorization
    /// Role/action denial from the workflow engine.
    #[error("{reason}")]
    Denied { reason: String },

    /// Password management attempted on an externally-authenticated user.
    #[error("Passwords for '{username}' are managed by the external provider")]
    ExternalProvider { username: String },

    /// Session token expired or unknown.
    #[error("Session invalid or expired")]
    SessionInvalid,

    // -- Conflict
    /// `(type, slug)` already taken.
    #[error("Slug conflict: {record_type}/{slug}")]
    SlugConflict { record_type: String, slug: String },

    /// Unique constraint violation, surfaced with the conflicting key.
    #[error("Conflict on {key}")]
    DuplicateKey { key: String },

    /// Optimistic concurrency check failed on update.
    #[error("Record changed since read: expected updated_at {expected}, found {actual}")]
    StaleUpdate { expected: String, actual: String },

    /// Resource lock held by another saga.
    #[error("Resource {resource_id} locked by saga {holder}")]
    LockHeld { resource_id: String, holder: String },

    /// A saga with the same idempotency key is still running.
    #[error("Operation with idempotency key '{key}' already in progress")]
    InProgress { key: String },

    // -- Transient
    /// A saga step exceeded the operation deadline.
    #[error("Step '{step}' timed out")]
    StepTimeout { step: String },

    // -- NotFound
    /// Generic entity not found.
    #[error("Entity not found")]
    NotFound,

    /// Record not found by id or path.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// User not found by username or id.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Saga not found by id.
    #[error("Saga not found: {0}")]
    SagaNotFound(String),

    // -- Operational
    /// A sync-mode hook subscriber failed or timed out.
    #[error("Hook handler for '{event}' failed: {reason}")]
    HookHandler { event: String, reason: String },

    /// A saga step failed and compensations ran.
    #[error("Operation '{saga_name}' failed at step '{step}': {cause}")]
    StepFailed {
        saga_name: String,
        step: String,
        cause: Box<Error>,
    },

    /// A compensation itself failed; the saga is parked as `failed` with its
    /// resource lock still held for operator drain.
    #[error("Compensation '{step}' failed for saga {saga_id}: {reason}")]
    CompensationFailed {
        saga_id: String,
        step: String,
        reason: String,
    },

    // -- Fatal
    /// Startup schema version does not match this binary.
    #[error("Schema version mismatch: database has {actual}, binary expects {expected}")]
    SchemaMismatch { expected: String, actual: String },

    /// The activity log is unreadable or torn.
    #[error("Activity log corrupted: {0}")]
    CorruptActivityLog(String),
}

impl Error {
    /// Buckets this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_)
            | Error::Validation(_)
            | Error::UnknownRecordType(_)
            | Error::UnknownStatus(_)
            | Error::InvalidFrontmatter { .. } => ErrorKind::Validation,

            Error::Denied { .. } | Error::ExternalProvider { .. } | Error::SessionInvalid => {
                ErrorKind::Authorization
            }

            Error::SlugConflict { .. }
            | Error::DuplicateKey { .. }
            | Error::StaleUpdate { .. }
            | Error::LockHeld { .. }
            | Error::InProgress { .. } => ErrorKind::Conflict,

            Error::NotFound
            | Error::RecordNotFound(_)
            | Error::UserNotFound(_)
            | Error::SagaNotFound(_) => ErrorKind::NotFound,

            Error::Libsql(_) | Error::Io(_) | Error::Git2(_) | Error::StepTimeout { .. } => {
                ErrorKind::Transient
            }

            Error::SerdeJson(_)
            | Error::SerdeYaml(_)
            | Error::Template(_)
            | Error::HookHandler { .. }
            | Error::StepFailed { .. } => ErrorKind::Operational,

            Error::CompensationFailed { .. }
            | Error::SchemaMismatch { .. }
            | Error::CorruptActivityLog(_) => ErrorKind::Fatal,
        }
    }

    /// True for errors a saga step may retry locally with backoff.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Creates the uniform transition-denied message.
    pub fn transition_denied(role: &str, from: &str, to: &str) -> Self {
        Error::Denied {
            reason: format!("Role '{role}' cannot transition from '{from}' to '{to}'"),
        }
    }

    /// Creates the uniform action-denied message.
    pub fn action_denied(role: &str, action: &str, record_type: &str) -> Self {
        Error::Denied {
            reason: format!("Role '{role}' cannot {action} records of type '{record_type}'"),
        }
    }
}

/// A specialized [`Result`] type for record engine operations.
pub type Result<T> = core::result::Result<T, Error>;
