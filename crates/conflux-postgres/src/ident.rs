//! SQL identifier validation and quoting.
//!
//! Every name that ends up in generated SQL is double-quoted, so any name
//! PostgreSQL can store is accepted: keywords such as `user` or `order`,
//! mixed case, punctuation. Validation only rejects what PostgreSQL itself
//! cannot hold. Table names may be schema-qualified; column names are taken
//! whole.

use crate::{ConfluxError, Result};

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Quotes a table name, quoting each part of a schema-qualified name
/// separately.
pub fn quote_identifier(name: &str) -> String {
    name.split('.').map(quote_name).collect::<Vec<_>>().join(".")
}

/// Quotes one name as a whole, dots included.
pub(crate) fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes each name and joins them with commas, e.g. `"a","b"`.
pub fn quote_list<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .map(quote_name)
        .collect::<Vec<_>>()
        .join(",")
}

/// Quotes each name behind a qualifier, e.g. `s."a",s."b"`.
pub fn qualified_list<'a, I>(qualifier: &str, names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .map(|name| format!("{}.{}", qualifier, quote_name(name)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Validates a table name, optionally qualified as `schema.table`.
pub fn validate_identifier(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(ConfluxError::Query(format!(
            "Invalid schema-qualified identifier '{}': must be in format 'schema.table'",
            name
        )));
    }
    parts.into_iter().try_for_each(validate_identifier_part)
}

/// Validates a single name: non-empty, no NUL byte, at most
/// [`MAX_IDENTIFIER_LEN`] bytes.
pub fn validate_identifier_part(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ConfluxError::Query("Identifier cannot be empty".to_string()));
    }
    if name.contains('\0') {
        return Err(ConfluxError::Query(format!(
            "Identifier '{}' contains a NUL byte",
            name.escape_debug()
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ConfluxError::Query(format!(
            "Identifier '{}' exceeds maximum length of {} bytes",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// Truncates `name` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_to(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("foos"), "\"foos\"");
        assert_eq!(quote_identifier("public.foos"), "\"public\".\"foos\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_lists() {
        assert_eq!(quote_list(["id", "name"]), "\"id\",\"name\"");
        assert_eq!(qualified_list("s", ["id", "name"]), "s.\"id\",s.\"name\"");
        assert_eq!(quote_list(Vec::<&str>::new()), "");
        // Column names are never split on dots.
        assert_eq!(quote_list(["a.b"]), "\"a.b\"");
    }

    #[test]
    fn test_validate_identifier_accepts_common_names() {
        assert!(validate_identifier("foos").is_ok());
        assert!(validate_identifier("my_data_field").is_ok());
        assert!(validate_identifier("createdAt").is_ok());
        assert!(validate_identifier("_changes").is_ok());
        assert!(validate_identifier("public.foos").is_ok());
    }

    #[test]
    fn test_validate_identifier_accepts_keywords_and_punctuation() {
        for name in ["role", "user", "order", "end", "table", "left", "select", "first-name", "1st", "Größe"] {
            assert!(validate_identifier_part(name).is_ok(), "{}", name);
        }
        assert!(validate_identifier("public.user").is_ok());
        assert!(validate_identifier(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_bad_names() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("public.").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
        assert!(validate_identifier_part("nul\0byte").is_err());
        // 32 two-byte characters are 64 bytes.
        assert!(validate_identifier_part(&"é".repeat(32)).is_err());
    }

    #[test]
    fn test_truncate_to_respects_char_boundaries() {
        assert_eq!(truncate_to("abcdef", 3), "abc");
        assert_eq!(truncate_to("abc", 10), "abc");
        assert_eq!(truncate_to("aé", 2), "a");
    }
}
