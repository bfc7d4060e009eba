//! YAML frontmatter parsing and canonical serialization.
//!
//! A record file is `---`, a YAML block, `---`, then the markdown body.
//! Parsing is tolerant: missing optional keys default, unknown keys are
//! preserved in the metadata bag. Serialization is canonical: known keys in
//! a fixed order, metadata keys alphabetical, so regenerating a file with
//! unchanged data is byte-identical and diff-friendly.

use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Timestamp format used in frontmatter and the index database.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A structured contributor entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorEntry {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Parsed frontmatter of a record file.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontmatter {
    pub id: Option<String>,
    pub title: String,
    pub record_type: String,
    pub status: String,
    pub slug: Option<String>,
    pub author: Option<String>,
    pub authors: Vec<AuthorEntry>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    /// Free-form keys: tags, module, version, geography, and anything
    /// unknown found at the top level.
    pub metadata: Mapping,
}

/// A record document: frontmatter plus markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDoc {
    pub front: Frontmatter,
    pub body: String,
}

/// Parses a record file into frontmatter + body.
///
/// `path` is only used for error reporting.
pub fn parse(content: &str, path: &str) -> Result<RecordDoc> {
    let rest = content.strip_prefix("---\n").ok_or_else(|| invalid(path, "missing frontmatter delimiter"))?;

    let (yaml_part, body_part) = match rest.split_once("\n---\n") {
        Some((y, b)) => (y, b),
        None => match rest.strip_suffix("\n---") {
            Some(y) => (y, ""),
            None => return Err(invalid(path, "unterminated frontmatter block")),
        },
    };

    let mapping: Mapping = serde_yaml::from_str(yaml_part)
        .map_err(|e| invalid(path, &e.to_string()))?;

    let mut front = Frontmatter {
        id: None,
        title: String::new(),
        record_type: String::new(),
        status: String::new(),
        slug: None,
        author: None,
        authors: Vec::new(),
        created_at: None,
        updated_at: None,
        metadata: Mapping::new(),
    };

    for (key, value) in &mapping {
        let Some(key_str) = key.as_str() else {
            continue;
        };
        match key_str {
            "id" => front.id = value.as_str().map(String::from),
            "title" => front.title = value.as_str().unwrap_or_default().to_string(),
            "type" => front.record_type = value.as_str().unwrap_or_default().to_string(),
            "status" => front.status = value.as_str().unwrap_or_default().to_string(),
            "slug" => front.slug = value.as_str().map(String::from),
            "author" => front.author = value.as_str().map(String::from),
            "authors" => front.authors = parse_authors(value),
            "created_at" => front.created_at = parse_datetime_value(value),
            "updated_at" => front.updated_at = parse_datetime_value(value),
            "metadata" => {
                if let Value::Mapping(m) = value {
                    for (mk, mv) in m {
                        front.metadata.insert(mk.clone(), mv.clone());
                    }
                }
            }
            // Unknown top-level keys are preserved, not dropped.
            _ => {
                front.metadata.insert(key.clone(), value.clone());
            }
        }
    }

    // Body: the first blank line after the delimiter is formatting, not
    // content.
    let body = body_part.strip_prefix('\n').unwrap_or(body_part).to_string();

    Ok(RecordDoc { front, body })
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::InvalidFrontmatter {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Authors may be bare strings or `{username, role}` mappings.
fn parse_authors(value: &Value) -> Vec<AuthorEntry> {
    let Value::Sequence(seq) = value else {
        return Vec::new();
    };
    seq.iter()
        .filter_map(|entry| match entry {
            Value::String(s) => Some(AuthorEntry {
                username: s.clone(),
                role: None,
            }),
            Value::Mapping(m) => {
                let username = m.get(Value::from("username"))?.as_str()?.to_string();
                let role = m
                    .get(Value::from("role"))
                    .and_then(|r| r.as_str())
                    .map(String::from);
                Some(AuthorEntry { username, role })
            }
            _ => None,
        })
        .collect()
}

/// Accepts the canonical format plus common ISO variants.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ"))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_datetime_value(value: &Value) -> Option<NaiveDateTime> {
    value.as_str().and_then(parse_datetime)
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Serializes a record document in canonical key order.
pub fn serialize(doc: &RecordDoc) -> Result<String> {
    let mut mapping = Mapping::new();
    let front = &doc.front;

    if let Some(id) = &front.id {
        mapping.insert(Value::from("id"), Value::from(id.as_str()));
    }
    mapping.insert(Value::from("title"), Value::from(front.title.as_str()));
    mapping.insert(Value::from("type"), Value::from(front.record_type.as_str()));
    mapping.insert(Value::from("status"), Value::from(front.status.as_str()));
    if let Some(slug) = &front.slug {
        mapping.insert(Value::from("slug"), Value::from(slug.as_str()));
    }
    if let Some(author) = &front.author {
        mapping.insert(Value::from("author"), Value::from(author.as_str()));
    }
    if !front.authors.is_empty() {
        let authors: Vec<Value> = front
            .authors
            .iter()
            .map(|a| {
                let mut m = Mapping::new();
                m.insert(Value::from("username"), Value::from(a.username.as_str()));
                if let Some(role) = &a.role {
                    m.insert(Value::from("role"), Value::from(role.as_str()));
                }
                Value::Mapping(m)
            })
            .collect();
        mapping.insert(Value::from("authors"), Value::Sequence(authors));
    }
    if let Some(created) = front.created_at {
        mapping.insert(Value::from("created_at"), Value::from(format_datetime(created)));
    }
    if let Some(updated) = front.updated_at {
        mapping.insert(Value::from("updated_at"), Value::from(format_datetime(updated)));
    }
    if !front.metadata.is_empty() {
        // Alphabetical within metadata: YAML mappings keep insertion order,
        // so sort the keys before inserting.
        let mut keys: Vec<Value> = front.metadata.keys().cloned().collect();
        keys.sort_by_key(|k| k.as_str().map(String::from).unwrap_or_default());
        let mut meta = Mapping::new();
        for key in keys {
            if let Some(v) = front.metadata.get(&key) {
                meta.insert(key.clone(), v.clone());
            }
        }
        mapping.insert(Value::from("metadata"), Value::Mapping(meta));
    }

    let yaml = serde_yaml::to_string(&mapping)?;
    if doc.body.is_empty() {
        Ok(format!("---\n{yaml}---\n"))
    } else {
        Ok(format!("---\n{yaml}---\n\n{}", doc.body))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn sample() -> RecordDoc {
        let mut metadata = Mapping::new();
        metadata.insert(
            Value::from("tags"),
            Value::Sequence(vec![Value::from("noise"), Value::from("zoning")]),
        );
        metadata.insert(Value::from("module"), Value::from("legal-register"));

        RecordDoc {
            front: Frontmatter {
                id: Some("bylaw/noise-restrictions".into()),
                title: "Noise Restrictions".into(),
                record_type: "bylaw".into(),
                status: "draft".into(),
                slug: Some("noise-restrictions".into()),
                author: Some("clerk-ada".into()),
                authors: vec![AuthorEntry {
                    username: "clerk-ada".into(),
                    role: Some("drafter".into()),
                }],
                created_at: parse_datetime("2025-06-01 09:00:00"),
                updated_at: parse_datetime("2025-06-01 09:00:00"),
                metadata,
            },
            body: "# Noise Restrictions\n\nQuiet hours start at 22:00.\n".into(),
        }
    }

    #[test]
    fn test_round_trip() {
        let doc = sample();
        let serialized = serialize(&doc).unwrap();
        let parsed = parse(&serialized, "records/bylaw/noise-restrictions.md").unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_serialize_is_stable() {
        let doc = sample();
        assert_eq!(serialize(&doc).unwrap(), serialize(&doc).unwrap());
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let content = "---\ntitle: T\ntype: bylaw\nstatus: draft\ncustom_field: kept\n---\n\nbody\n";
        let doc = parse(content, "x.md").unwrap();
        assert_eq!(
            doc.front.metadata.get(Value::from("custom_field")),
            Some(&Value::from("kept"))
        );

        // And they survive re-serialization.
        let again = parse(&serialize(&doc).unwrap(), "x.md").unwrap();
        assert_eq!(
            again.front.metadata.get(Value::from("custom_field")),
            Some(&Value::from("kept"))
        );
    }

    #[test]
    fn test_authors_as_bare_strings() {
        let content = "---\ntitle: T\ntype: bylaw\nstatus: draft\nauthors:\n  - ada\n  - grace\n---\n";
        let doc = parse(content, "x.md").unwrap();
        assert_eq!(doc.front.authors.len(), 2);
        assert_eq!(doc.front.authors[0].username, "ada");
        assert!(doc.front.authors[0].role.is_none());
    }

    #[test]
    fn test_missing_frontmatter_rejected() {
        let err = parse("# Just markdown\n", "x.md").unwrap_err();
        assert!(matches!(err, Error::InvalidFrontmatter { .. }));
    }

    #[test]
    fn test_metadata_keys_sorted() {
        let doc = sample();
        let serialized = serialize(&doc).unwrap();
        let module_pos = serialized.find("module:").unwrap();
        let tags_pos = serialized.find("tags:").unwrap();
        assert!(module_pos < tags_pos);
    }

    #[test]
    fn test_datetime_variants() {
        assert!(parse_datetime("2025-06-01 09:00:00").is_some());
        assert!(parse_datetime("2025-06-01T09:00:00").is_some());
        assert!(parse_datetime("2025-06-01T09:00:00Z").is_some());
        assert!(parse_datetime("2025-06-01").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
