//! Catalog error taxonomy.
//!
//! The five user-visible kinds map directly onto the contract every caller
//! relies on: `Malformed` is always client-caused and never retried;
//! `Unauthorized` (no usable credentials) and `Forbidden` (policy said Deny)
//! are distinct outcomes; `Conflict` carries enough detail to identify the
//! offending tag or value; `NotFound` is deliberately indistinguishable from
//! an unauthorized read of an existing subject.

use thiserror::Error;

/// Catalog operation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

impl From<curio_core::Error> for CatalogError {
    fn from(e: curio_core::Error) -> Self {
        CatalogError::Malformed(e.to_string())
    }
}

impl From<curio_query::ParseError> for CatalogError {
    fn from(e: curio_query::ParseError) -> Self {
        CatalogError::Malformed(e.to_string())
    }
}

impl From<curio_query::CompileError> for CatalogError {
    fn from(e: curio_query::CompileError) -> Self {
        match e {
            curio_query::CompileError::ReferenceCycle(tag) => {
                CatalogError::Internal(format!("reference cycle through tag '{tag}'"))
            }
            other => CatalogError::Malformed(other.to_string()),
        }
    }
}

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

fn db_code(e: &CatalogError) -> Option<String> {
    match e {
        CatalogError::Database(sqlx::Error::Database(db)) => {
            db.code().map(|c| c.into_owned())
        }
        _ => None,
    }
}

impl CatalogError {
    /// Whether the whole logical operation may be re-executed from scratch.
    ///
    /// Serialization and deadlock failures always are. A uniqueness
    /// violation is retried too: the retry observes the committed state and
    /// either no-ops or re-fails with a user-visible conflict.
    pub fn is_transient(&self) -> bool {
        matches!(
            db_code(self).as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(UNIQUE_VIOLATION)
        )
    }

    /// Map database-level constraint failures onto the user-visible
    /// taxonomy once retries are exhausted or skipped.
    pub fn into_user(self) -> CatalogError {
        match db_code(&self).as_deref() {
            Some(UNIQUE_VIOLATION) => {
                CatalogError::Conflict(format!("uniqueness violation: {self}"))
            }
            Some(FOREIGN_KEY_VIOLATION) => {
                CatalogError::Conflict(format!("reference violation: {self}"))
            }
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_conflicts_are_not_transient() {
        assert!(!CatalogError::Conflict("ambiguous match".into()).is_transient());
        assert!(!CatalogError::Malformed("bad path".into()).is_transient());
        assert!(!CatalogError::NotFound("no subject".into()).is_transient());
    }

    #[test]
    fn test_into_user_passes_plain_errors_through() {
        let e = CatalogError::Forbidden("write denied".into()).into_user();
        assert!(matches!(e, CatalogError::Forbidden(_)));
    }
}
