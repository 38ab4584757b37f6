//! SQL identifier validation.
//!
//! Mapper metadata feeds table and column names straight into generated
//! statements, so the registry refuses anything that is not a plain
//! identifier.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Check that `name` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
///
/// # Examples
///
/// ```
/// use sqlunit_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("order_lines"));
/// assert!(!is_valid_identifier("users; DROP TABLE x"));
/// assert!(!is_valid_identifier("1abc"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    match identifier_regex() {
        Some(re) => re.is_match(name),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("Col9"));
    }

    #[test]
    fn test_rejects_empty_and_punctuation() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("first name"));
        assert!(!is_valid_identifier("a\"b"));
        assert!(!is_valid_identifier("a;b"));
        assert!(!is_valid_identifier("9lives"));
    }

    #[test]
    fn test_rejects_unicode() {
        assert!(!is_valid_identifier("naïve"));
    }
}
