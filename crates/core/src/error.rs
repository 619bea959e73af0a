//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid tag name: {0}")]
    InvalidTagName(String),

    #[error("unknown dbtype: {0}")]
    UnknownDbType(String),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("invalid value for {dbtype} tag: {raw:?}: {detail}")]
    InvalidValue {
        dbtype: &'static str,
        raw: String,
        detail: String,
    },

    #[error("value type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid tag definition: {0}")]
    InvalidTagDef(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
