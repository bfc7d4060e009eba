//! Append-only JSONL activity log.
//!
//! Every operation writes an intent entry *before* its hook handlers run
//! and a trailing result entry on completion, so a crashed handler still
//! leaves an auditable trail. The file is the source of truth; each append
//! is mirrored into the `activity` table for query.
//!
//! The file has a single writer: appends take an async lock, write one line,
//! and flush. Rotation renames the whole file aside (atomic on POSIX) once
//! it exceeds the configured size.

use crate::Principal;
use crate::error::Result;
use crate::model::{ModelManager, activity::ActivityBmc};
use crate::store::frontmatter::DATETIME_FORMAT;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where an operation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cli,
    Api,
    Workflow,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Cli => "cli",
            Source::Api => "api",
            Source::Workflow => "workflow",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub target_type: String,
    pub id: String,
}

/// One line of the activity stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: String,
    pub source: Source,
    pub actor: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ActivityEntry {
    pub fn now(source: Source, actor: &str, action: &str) -> Self {
        ActivityEntry {
            timestamp: chrono::Utc::now()
                .naive_utc()
                .format(DATETIME_FORMAT)
                .to_string(),
            source,
            actor: actor.to_string(),
            action: action.to_string(),
            target: None,
            result: "ok".to_string(),
            metadata: None,
        }
    }

    pub fn with_target(mut self, target_type: &str, id: &str) -> Self {
        self.target = Some(Target {
            target_type: target_type.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn with_result(mut self, result: &str) -> Self {
        self.result = result.to_string();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Handle over the activity log file.
#[derive(Clone)]
pub struct ActivityLog {
    path: PathBuf,
    rotate_bytes: u64,
    write_lock: Arc<Mutex<()>>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, rotate_bytes: u64) -> Self {
        ActivityLog {
            path: path.into(),
            rotate_bytes,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Appends one entry: JSONL line first, DB mirror second.
    pub async fn append(
        &self,
        ctx: &Principal,
        mm: &ModelManager,
        entry: &ActivityEntry,
    ) -> Result<()> {
        {
            let _guard = self.write_lock.lock().await;
            self.rotate_if_needed()?;

            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}")?;
            file.flush()?;
        }

        ActivityBmc::insert(
            ctx,
            mm,
            entry.source.as_str(),
            &entry.actor,
            &entry.action,
            entry.target.as_ref().map(|t| t.target_type.as_str()),
            entry.target.as_ref().map(|t| t.id.as_str()),
            &entry.result,
            entry.metadata.as_ref(),
        )
        .await?;
        Ok(())
    }

    /// Renames the log aside once it grows past the threshold. The rename
    /// is atomic; the next append recreates the file.
    fn rotate_if_needed(&self) -> Result<()> {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < self.rotate_bytes {
            return Ok(());
        }

        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let rotated = self.path.with_extension(format!("log.{stamp}"));
        std::fs::rename(&self.path, rotated)?;
        Ok(())
    }

    /// Reads back all entries currently in the live file.
    pub fn read_entries(&self) -> Result<Vec<ActivityEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(crate::error::Error::from(e)),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(line).map_err(|e| {
                crate::error::Error::CorruptActivityLog(format!(
                    "{}: {e}",
                    self.path.display()
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_entry_serializes_flat() {
        let entry = ActivityEntry::now(Source::Cli, "clerk-ada", "record:created")
            .with_target("bylaw", "bylaw/noise")
            .with_result("success");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"source\":\"cli\""));
        assert!(json.contains("\"type\":\"bylaw\""));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn test_rotation_renames_once_over_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.log");
        std::fs::write(&path, "x".repeat(64)).unwrap();

        let log = ActivityLog::new(&path, 32);
        log.rotate_if_needed().unwrap();
        assert!(!path.exists());
        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].starts_with("activity.log."));
    }

    #[test]
    fn test_read_entries_rejects_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.log");
        std::fs::write(&path, "{\"not\": \"an entry\"\n").unwrap();

        let log = ActivityLog::new(&path, 1024);
        assert!(log.read_entries().is_err());
    }
}
