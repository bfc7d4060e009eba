//! On-disk record files.
//!
//! The records tree is the source of truth for content. Writes are atomic:
//! serialize to a temp file in the same directory, fsync, rename over the
//! target. A reader never observes a partial file.
//!
//! Layout under the data directory:
//!
//! ```text
//! records/<type>/<slug>.md
//! records/index.yml
//! records/archive/<type>/<slug>.md
//! ```

use crate::error::{Error, Result};
use crate::store::frontmatter::{self, RecordDoc};
use crate::types::{RecordSlug, RecordType};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory holding record files, relative to the data dir.
pub const RECORDS_DIR: &str = "records";

/// Archive subtree for deleted records.
pub const ARCHIVE_DIR: &str = "records/archive";

/// Handle over the records tree of one data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    data_dir: PathBuf,
}

impl RecordStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Repository-relative path for a live record.
    pub fn record_rel_path(record_type: &RecordType, slug: &RecordSlug) -> PathBuf {
        Path::new(RECORDS_DIR)
            .join(record_type.as_str())
            .join(format!("{}.md", slug.as_str()))
    }

    /// Repository-relative path for an archived record.
    pub fn archive_rel_path(record_type: &RecordType, slug: &RecordSlug) -> PathBuf {
        Path::new(ARCHIVE_DIR)
            .join(record_type.as_str())
            .join(format!("{}.md", slug.as_str()))
    }

    pub fn abs_path(&self, rel: &Path) -> PathBuf {
        self.data_dir.join(rel)
    }

    pub fn exists(&self, rel: &Path) -> bool {
        self.abs_path(rel).is_file()
    }

    /// Serializes and writes a record document atomically.
    ///
    /// The temp file lives in the target's directory so the final rename
    /// never crosses a filesystem boundary.
    pub fn write(&self, rel: &Path, doc: &RecordDoc) -> Result<()> {
        let target = self.abs_path(rel);
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("path has no parent: {}", rel.display())))?;
        std::fs::create_dir_all(parent)?;

        let content = frontmatter::serialize(doc)?;

        let tmp_name = format!(
            ".{}.tmp-{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "record".to_string()),
            std::process::id()
        );
        let tmp_path = parent.join(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, &target)?;
        Ok(())
    }

    /// Reads and parses a record file.
    pub fn read(&self, rel: &Path) -> Result<RecordDoc> {
        let target = self.abs_path(rel);
        let content = match std::fs::read_to_string(&target) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RecordNotFound(rel.display().to_string()));
            }
            Err(e) => return Err(Error::from(e)),
        };
        frontmatter::parse(&content, &rel.display().to_string())
    }

    /// Reads the raw text of a record file without parsing.
    pub fn read_raw(&self, rel: &Path) -> Result<String> {
        let target = self.abs_path(rel);
        match std::fs::read_to_string(&target) {
            Ok(c) => Ok(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::RecordNotFound(rel.display().to_string()))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Removes a record file outright. Most callers want [`Self::archive`].
    pub fn delete(&self, rel: &Path) -> Result<()> {
        match std::fs::remove_file(self.abs_path(rel)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::RecordNotFound(rel.display().to_string()))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Moves a record into the archive subtree, preserving its content and
    /// history linkage. Returns the archive-relative path.
    pub fn archive(&self, record_type: &RecordType, slug: &RecordSlug) -> Result<PathBuf> {
        let from_rel = Self::record_rel_path(record_type, slug);
        let to_rel = Self::archive_rel_path(record_type, slug);
        let from = self.abs_path(&from_rel);
        let to = self.abs_path(&to_rel);

        if !from.is_file() {
            return Err(Error::RecordNotFound(from_rel.display().to_string()));
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from, &to)?;
        Ok(to_rel)
    }

    /// Restores an archived record to the live tree (delete compensation).
    pub fn unarchive(&self, record_type: &RecordType, slug: &RecordSlug) -> Result<PathBuf> {
        let from_rel = Self::archive_rel_path(record_type, slug);
        let to_rel = Self::record_rel_path(record_type, slug);
        let from = self.abs_path(&from_rel);
        let to = self.abs_path(&to_rel);

        if !from.is_file() {
            return Err(Error::RecordNotFound(from_rel.display().to_string()));
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from, &to)?;
        Ok(to_rel)
    }

    /// Walks the live records tree and returns relative paths of `*.md`
    /// files, honoring `.gitignore` semantics. The archive subtree and
    /// `index.yml` are excluded.
    pub fn list(&self, record_type: Option<&RecordType>) -> Result<Vec<PathBuf>> {
        let root = match record_type {
            Some(t) => self.data_dir.join(RECORDS_DIR).join(t.as_str()),
            None => self.data_dir.join(RECORDS_DIR),
        };
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let archive_root = self.data_dir.join(ARCHIVE_DIR);
        let mut paths = Vec::new();

        let walker = ignore::WalkBuilder::new(&root)
            .hidden(true)
            .git_ignore(true)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if path.starts_with(&archive_root) {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(&self.data_dir) {
                paths.push(rel.to_path_buf());
            }
        }

        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::store::frontmatter::Frontmatter;
    use tempfile::TempDir;

    fn doc(title: &str, record_type: &str, slug: &str) -> RecordDoc {
        RecordDoc {
            front: Frontmatter {
                id: Some(format!("{record_type}/{slug}")),
                title: title.into(),
                record_type: record_type.into(),
                status: "draft".into(),
                slug: Some(slug.into()),
                author: Some("clerk-ada".into()),
                authors: Vec::new(),
                created_at: None,
                updated_at: None,
                metadata: Default::default(),
            },
            body: "Body.\n".into(),
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let rel = RecordStore::record_rel_path(&"bylaw".into(), &"noise".into());

        let d = doc("Noise", "bylaw", "noise");
        store.write(&rel, &d).unwrap();
        let read_back = store.read(&rel).unwrap();
        assert_eq!(read_back, d);
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let rel = RecordStore::record_rel_path(&"bylaw".into(), &"noise".into());
        store.write(&rel, &doc("Noise", "bylaw", "noise")).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("records/bylaw"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["noise.md".to_string()]);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let rel = RecordStore::record_rel_path(&"bylaw".into(), &"ghost".into());
        let err = store.read(&rel).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(_)));
    }

    #[test]
    fn test_archive_and_unarchive() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());
        let record_type: RecordType = "bylaw".into();
        let slug: RecordSlug = "noise".into();
        let rel = RecordStore::record_rel_path(&record_type, &slug);
        store.write(&rel, &doc("Noise", "bylaw", "noise")).unwrap();

        let archived = store.archive(&record_type, &slug).unwrap();
        assert!(!store.exists(&rel));
        assert!(store.exists(&archived));

        store.unarchive(&record_type, &slug).unwrap();
        assert!(store.exists(&rel));
    }

    #[test]
    fn test_list_skips_archive_and_non_markdown() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path());

        store
            .write(
                &RecordStore::record_rel_path(&"bylaw".into(), &"noise".into()),
                &doc("Noise", "bylaw", "noise"),
            )
            .unwrap();
        store
            .write(
                &RecordStore::record_rel_path(&"policy".into(), &"parks".into()),
                &doc("Parks", "policy", "parks"),
            )
            .unwrap();
        std::fs::create_dir_all(dir.path().join("records/archive/bylaw")).unwrap();
        std::fs::write(
            dir.path().join("records/archive/bylaw/old.md"),
            "---\ntitle: Old\n---\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("records/index.yml"), "entries: []\n").unwrap();

        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 2);

        let bylaws = store.list(Some(&"bylaw".into())).unwrap();
        assert_eq!(bylaws.len(), 1);
        assert!(bylaws[0].ends_with(Path::new("bylaw/noise.md")));
    }
}
