//! Error types for acctmig.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for migration operations.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Could not resolve or open a database connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The select-statement catalog could not be loaded.
    #[error("Catalog error at {location}: {message}")]
    Catalog { location: String, message: String },

    /// A query against the source (or an anchor count) failed.
    #[error("Query error: {0}")]
    Query(String),

    /// A statement replayed against the target failed.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The target rejected a statement on a constraint.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A value has no SQL literal form.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// A row could not be turned into statements.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Audit artifacts could not be written.
    #[error("Failed to persist {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    /// A connect or statement deadline elapsed.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Create a catalog error at `location` (`file:line` or a template label).
    pub fn catalog(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Catalog {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error for the given path.
    pub fn persistence(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Errors that abort the whole invocation rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Config(_) | Self::Catalog { .. }
        )
    }
}

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err =
            MigrateError::catalog("check.sql:3", "expected exactly one :account_id placeholder");
        assert_eq!(
            err.to_string(),
            "Catalog error at check.sql:3: expected exactly one :account_id placeholder"
        );

        let err = MigrateError::persistence("/tmp/out/Delete_queries_for_7.sql", "disk full");
        assert_eq!(
            err.to_string(),
            "Failed to persist /tmp/out/Delete_queries_for_7.sql: disk full"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MigrateError::Connection("refused".into()).is_fatal());
        assert!(MigrateError::Config("missing".into()).is_fatal());
        assert!(!MigrateError::Query("ORA-00942".into()).is_fatal());
        assert!(!MigrateError::UnsupportedType("BFILE".into()).is_fatal());
    }
}
