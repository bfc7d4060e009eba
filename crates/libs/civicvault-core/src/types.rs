//! Strong newtypes for domain identifiers.
//!
//! These newtypes prevent accidental misuse of identifiers (e.g. passing a
//! slug where an opaque record id is expected). All serialize transparently.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque record identifier, stable across renames.
///
/// Minted at creation as `<type>/<slug>`; treated as opaque thereafter:
/// a record keeps its id even if the file moves to the archive subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints the id for a freshly created record.
    pub fn mint(record_type: &RecordType, slug: &RecordSlug) -> Self {
        Self(format!("{}/{}", record_type.as_str(), slug.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filename-safe record slug, unique per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordSlug(pub String);

impl RecordSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordSlug {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordSlug {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RecordSlug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configured record type (bylaw, policy, resolution, ...).
///
/// The set is open: validity is checked against the manifest at the
/// engine boundary, not encoded in the type system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordType(pub String);

impl RecordType {
    pub fn new(t: impl Into<String>) -> Self {
        Self(t.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RecordType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier (database primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    #[inline]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<UserId> for i64 {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Saga identifier (UUID v4, stored as its hyphenated string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(pub String);

impl SagaId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SagaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_record_id_mint() {
        let id = RecordId::mint(&RecordType::new("bylaw"), &RecordSlug::new("noise"));
        assert_eq!(id.as_str(), "bylaw/noise");
    }

    #[test]
    fn test_serde_transparent() {
        let id = RecordId::new("bylaw/noise");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bylaw/noise\"");

        let uid = UserId::new(42);
        assert_eq!(serde_json::to_string(&uid).unwrap(), "42");
    }

    #[test]
    fn test_saga_id_generate_unique() {
        assert_ne!(SagaId::generate(), SagaId::generate());
    }
}
