//! Typed errors for the pieces callers need to match on.
//!
//! Adapters, configuration and the CLI use `anyhow`; the index and the
//! generators return these enums so that a rejected request or a malformed
//! document can be told apart from an I/O failure.

use thiserror::Error;

/// Errors returned by [`Index`](crate::index::Index) requests.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An argument of an `add`/`remove` batch carried an empty key.
    ///
    /// The whole batch is rejected before any mutation.
    #[error("argument {position} of the batch has no key")]
    MissingKey { position: usize },

    /// A `get` asked for a key that is not in the index.
    #[error("no entry with key '{0}'")]
    UnknownKey(String),

    /// The writer task has been destroyed or is no longer running.
    #[error("index is closed")]
    Closed,
}

/// Errors produced while turning raw bytes into an entry.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The document has no header line (no newline at all).
    #[error("there must be at least one line")]
    MissingHeader,

    /// The header line does not split into title, date and tags.
    #[error("can't find title, date and tags in header '{0}'")]
    MalformedHeader(String),

    /// The header date could not be parsed.
    #[error("parsing time '{value}': {source}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// The document is not valid UTF-8 text.
    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    /// Reading an auxiliary resource failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_error_messages_name_the_offender() {
        let err = IndexError::UnknownKey("abc".to_string());
        assert_eq!(err.to_string(), "no entry with key 'abc'");

        let err = IndexError::MissingKey { position: 2 };
        assert!(err.to_string().contains("argument 2"));
    }

    #[test]
    fn invalid_date_keeps_its_source() {
        let source = chrono::NaiveDate::parse_from_str("nope", "%Y-%m-%d").unwrap_err();
        let err = GenerateError::InvalidDate {
            value: "nope".to_string(),
            source,
        };
        assert!(err.to_string().starts_with("parsing time 'nope'"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
