//! ID parse errors.

use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// A well-formed ID of another kind, e.g. a batch ID where a task ID
    /// was expected.
    #[error("expected a {expected} ID, got a '{actual}' prefix")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}

/// Splits `{prefix}_{ulid}` and checks the prefix. Used by `define_id!`.
#[doc(hidden)]
pub fn parse_prefixed(expected: &'static str, input: &str) -> Result<Ulid, IdError> {
    if input.is_empty() {
        return Err(IdError::Empty);
    }
    let (prefix, raw) = input.split_once('_').ok_or(IdError::MissingSeparator)?;
    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }
    Ulid::from_string(raw).map_err(|e| IdError::InvalidUlid(e.to_string()))
}
