//! Entry key derivation.
//!
//! Keys must be deterministic: the same input always yields the same key,
//! so an entry keeps its slot in the index across refreshes until the text
//! the key is derived from changes.

use sha2::{Digest, Sha256};

/// Derive a key from a title by replacing every whitespace character with `_`.
///
/// ```
/// use content_index::key::from_title;
/// assert_eq!(from_title("Hello Rust world"), "Hello_Rust_world");
/// ```
pub fn from_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Derive a key from content bytes as a lowercase hex SHA-256 digest.
pub fn from_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
