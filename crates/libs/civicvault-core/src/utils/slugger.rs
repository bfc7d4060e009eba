//! Slug derivation for record titles.
//!
//! Slugs are derived from titles (lowercase, unreserved ASCII,
//! hyphen-joined). A slug is never mutated once assigned; renaming a record
//! requires delete + create.

use crate::types::RecordSlug;

/// Converts a title to a filename-safe slug.
///
/// # Examples
///
/// ```
/// use civicvault_core::utils::slugify;
///
/// assert_eq!(slugify("Noise Restrictions"), "noise-restrictions");
/// assert_eq!(slugify("Café & Parks!"), "cafe-parks");
/// ```
pub fn slugify(title: &str) -> String {
    slug::slugify(title)
}

/// Produces the candidate slug for collision attempt `n`.
///
/// Attempt 0 is the base slug itself; attempt 1 appends `-2`, attempt 2
/// appends `-3`, and so on, matching the stable collision-count contract.
pub fn slug_candidate(base: &str, attempt: usize) -> RecordSlug {
    if attempt == 0 {
        RecordSlug::new(base)
    } else {
        RecordSlug::new(format!("{}-{}", base, attempt + 1))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Noise Restrictions"), "noise-restrictions");
        assert_eq!(slugify("  Trailing  Spaces  "), "trailing-spaces");
    }

    #[test]
    fn test_slugify_transliterates() {
        assert_eq!(slugify("Café & Restaurant"), "cafe-restaurant");
    }

    #[test]
    fn test_slug_candidates() {
        assert_eq!(slug_candidate("noise", 0).as_str(), "noise");
        assert_eq!(slug_candidate("noise", 1).as_str(), "noise-2");
        assert_eq!(slug_candidate("noise", 2).as_str(), "noise-3");
    }
}
