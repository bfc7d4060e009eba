//! Low-level storage operations for database, git, and record files.
//!
//! Three stores cooperate behind the engine:
//!
//! 1. **Records tree** (`records/<type>/<slug>.md`); source of truth for
//!    content, handled by [`record_store`]
//! 2. **SQLite database** (libsql); derived index, authoritative for queries
//! 3. **Git repository**; history and audit, handled by [`git_store`]
//!
//! The DB never creates files; the record store never writes to the DB.
//!
//! # Database Configuration
//!
//! The database is configured for concurrent CLI + API workers:
//! - WAL mode for concurrent reads during writes
//! - 30-second busy timeout for lock contention
//! - 64MB cache for reduced I/O

use crate::error::{Error, Result};
use libsql::{Builder, Connection};
use std::path::Path;

/// Type alias for database connections.
pub type Db = Connection;

/// Git gateway: staging, commits, history, diffs.
pub mod git_store;

/// YAML frontmatter parsing and canonical serialization.
pub mod frontmatter;

/// On-disk record files with atomic writes.
pub mod record_store;

/// Storage limits from `.civic/storage.yml`.
pub mod storage_config;

/// Schema version this binary expects; startup refuses writes on mismatch.
const EXPECTED_SCHEMA_VERSION: &str = "3";

/// Creates a new database connection with migrations applied.
///
/// Creates the parent directory if needed, opens or creates the SQLite
/// database, applies concurrency pragmas, runs all migrations in order, and
/// verifies the schema version.
pub async fn new_db_pool(db_path: &Path) -> Result<Db> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Builder::new_local(db_path).build().await?;
    let conn = db.connect()?;

    // WAL mode: enables concurrent reads during writes
    let _ = conn.execute("PRAGMA journal_mode=WAL;", ()).await;
    // busy_timeout: wait when the database is locked instead of failing
    let _ = conn.execute("PRAGMA busy_timeout=30000;", ()).await;
    // synchronous=NORMAL: good balance of safety and performance with WAL
    let _ = conn.execute("PRAGMA synchronous=NORMAL;", ()).await;
    // cache_size: negative = KB, so -64000 = 64MB
    let _ = conn.execute("PRAGMA cache_size=-64000;", ()).await;
    let _ = conn.execute("PRAGMA foreign_keys=ON;", ()).await;

    // Apply all migrations in order.
    // SQLite's IF NOT EXISTS makes table creation idempotent.
    let migrations = [
        include_str!("../../../../../migrations/001_initial_schema.sql"),
        include_str!("../../../../../migrations/002_sagas_and_locks.sql"),
        include_str!("../../../../../migrations/003_activity.sql"),
    ];

    for migration in &migrations {
        conn.execute_batch(migration).await?;
    }

    verify_schema_version(&conn).await?;

    Ok(conn)
}

/// Confirms the stored schema version matches this binary.
///
/// A mismatch is fatal: the process must refuse to serve writes rather than
/// run against a schema it does not understand.
pub async fn verify_schema_version(db: &Db) -> Result<()> {
    let stmt = db
        .prepare("SELECT value FROM settings WHERE key = 'schema_version'")
        .await?;
    let mut rows = stmt.query(()).await?;

    let actual: String = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        return Err(Error::SchemaMismatch {
            expected: EXPECTED_SCHEMA_VERSION.to_string(),
            actual: "missing".to_string(),
        });
    };

    if actual != EXPECTED_SCHEMA_VERSION {
        return Err(Error::SchemaMismatch {
            expected: EXPECTED_SCHEMA_VERSION.to_string(),
            actual,
        });
    }
    Ok(())
}
