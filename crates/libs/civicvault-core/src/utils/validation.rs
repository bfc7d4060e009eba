// Allow expect in this module: regex patterns are compile-time verified
#![allow(clippy::expect_used)]

//! Input validation with recovery hints.
//!
//! Validation failures carry the offending field and, where possible, a
//! sanitized suggestion the caller can retry with. These surface as
//! `ErrorKind::Validation` and are never retried.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref USERNAME_RE: Regex =
        Regex::new(r"^[a-z0-9][a-z0-9-]{1,48}[a-z0-9]$").expect("valid regex pattern");
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex pattern");
    static ref SLUG_RE: Regex = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid regex pattern");
    static ref ISO_DATE_RE: Regex =
        Regex::new(r"^\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}(:\d{2})?(\.\d+)?(Z|[+-]\d{2}:\d{2})?)?$")
            .expect("valid regex pattern");
}

/// Usernames that can never be registered.
pub const RESERVED_USERNAMES: &[&str] = &[
    "admin", "root", "system", "public", "anonymous", "civicvault", "api", "null", "undefined",
];

/// Input validation errors with recovery hints.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ValidationError {
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: String,
        provided: String,
        reason: String,
        suggestion: Option<String>,
    },

    #[error("Username must be 3-50 lowercase alphanumeric/hyphen chars, got: {provided}")]
    InvalidUsername {
        provided: String,
        suggestion: String,
    },

    #[error("Username '{provided}' is reserved")]
    ReservedUsername { provided: String },

    #[error("Invalid email address: {provided}")]
    InvalidEmail { provided: String },

    #[error("Slug must be lowercase hyphen-joined ASCII, got: {provided}")]
    InvalidSlug {
        provided: String,
        suggestion: String,
    },

    #[error("Tags must be lowercase strings, got: {provided}")]
    InvalidTag { provided: String },

    #[error("Date must be ISO 8601, got: {provided}")]
    InvalidDate { provided: String },
}

impl ValidationError {
    pub fn context(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Validates a username against format rules and the reserved list.
pub fn validate_username(name: &str) -> Result<(), ValidationError> {
    if RESERVED_USERNAMES.contains(&name) {
        return Err(ValidationError::ReservedUsername {
            provided: name.to_string(),
        });
    }
    if USERNAME_RE.is_match(name) {
        return Ok(());
    }
    Err(ValidationError::InvalidUsername {
        provided: name.to_string(),
        suggestion: sanitize_username(name),
    })
}

/// Sanitizes a username for a retry suggestion.
pub fn sanitize_username(input: &str) -> String {
    let cleaned: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    cleaned
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(50)
        .collect()
}

/// Validates email format. Absent email is valid; this checks shape only.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if EMAIL_RE.is_match(email) {
        return Ok(());
    }
    Err(ValidationError::InvalidEmail {
        provided: email.to_string(),
    })
}

/// Validates a slug already derived (or supplied in frontmatter).
pub fn validate_slug(slug: &str) -> Result<(), ValidationError> {
    if SLUG_RE.is_match(slug) {
        return Ok(());
    }
    Err(ValidationError::InvalidSlug {
        provided: slug.to_string(),
        suggestion: crate::utils::slugify(slug),
    })
}

/// Validates a tag: lowercase, no surrounding whitespace.
pub fn validate_tag(tag: &str) -> Result<(), ValidationError> {
    if !tag.is_empty() && tag == tag.to_lowercase() && tag.trim() == tag {
        return Ok(());
    }
    Err(ValidationError::InvalidTag {
        provided: tag.to_string(),
    })
}

/// Validates an ISO 8601 date or datetime string.
pub fn validate_iso_date(value: &str) -> Result<(), ValidationError> {
    if ISO_DATE_RE.is_match(value) {
        return Ok(());
    }
    Err(ValidationError::InvalidDate {
        provided: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_valid_usernames() {
        for name in ["ada", "clerk-ada", "a2c", "council-member-2"] {
            assert!(validate_username(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_usernames() {
        for name in ["ab", "Ada", "-leading", "trailing-", "has space", ""] {
            assert!(validate_username(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn test_reserved_usernames() {
        let err = validate_username("admin").unwrap_err();
        assert!(matches!(err, ValidationError::ReservedUsername { .. }));
    }

    #[test]
    fn test_sanitize_username() {
        assert_eq!(sanitize_username("Clerk Ada!"), "clerk-ada");
    }

    #[test]
    fn test_email() {
        assert!(validate_email("ada@town.gov").is_ok());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("a@b").is_err());
    }

    #[test]
    fn test_slug() {
        assert!(validate_slug("noise-restrictions").is_ok());
        assert!(validate_slug("noise-restrictions-2").is_ok());
        assert!(validate_slug("Noise").is_err());
        assert!(validate_slug("double--hyphen").is_err());
    }

    #[test]
    fn test_tags() {
        assert!(validate_tag("noise").is_ok());
        assert!(validate_tag("Noise").is_err());
        assert!(validate_tag(" padded").is_err());
    }

    #[test]
    fn test_iso_dates() {
        assert!(validate_iso_date("2025-06-01").is_ok());
        assert!(validate_iso_date("2025-06-01T12:30:00Z").is_ok());
        assert!(validate_iso_date("2025-06-01 12:30:00").is_ok());
        assert!(validate_iso_date("June 1st").is_err());
    }
}
