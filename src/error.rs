use sqlx::error::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the bootstrap loader.
///
/// Expected divergences (a skipped row, an existing record) are reported through
/// result values; everything here is a condition the caller cannot encode as one.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("validation error: row {row} for table {table} has {actual} values, expected {expected}")]
    ColumnCountMismatch {
        table: String,
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },
    #[error("ambiguous match in {table}: {count} rows matched a filter expected to be unique")]
    AmbiguousMatch { table: String, count: i64 },
    #[error("Cannot start nested transaction")]
    NestedTransaction,
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
    #[error("connection error: {0}")]
    Connection(sqlx::Error),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("integrity verification failed with {failures} violation(s), first: {first}")]
    IntegrityFailure { failures: usize, first: String },
}

impl LoaderError {
    /// Classify an sqlx error raised while writing to `table`.
    pub fn from_sqlx(err: sqlx::Error, table: &str) -> Self {
        match err {
            sqlx::Error::Database(db_err)
                if matches!(
                    db_err.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                ) =>
            {
                LoaderError::ConstraintViolation {
                    table: table.to_string(),
                    message: db_err.message().to_string(),
                }
            }
            err @ (sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed) => LoaderError::Connection(err),
            err => LoaderError::Database(err),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LoaderError::Validation(message.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        LoaderError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Transient failures that may succeed when the same idempotent operation is retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            LoaderError::Connection(_) => true,
            LoaderError::Database(sqlx::Error::Database(db_err)) => {
                let message = db_err.message();
                message.contains("database is locked") || message.contains("database is busy")
            }
            _ => false,
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, LoaderError::ConstraintViolation { .. })
    }
}

impl From<sqlx::Error> for LoaderError {
    fn from(err: sqlx::Error) -> Self {
        LoaderError::from_sqlx(err, "<unknown>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_connection_errors() {
        let err = LoaderError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, LoaderError::Connection(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn row_not_found_is_not_retriable() {
        let err = LoaderError::from_sqlx(sqlx::Error::RowNotFound, "events");
        assert!(matches!(err, LoaderError::Database(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn nested_transaction_message_is_stable() {
        assert_eq!(
            LoaderError::NestedTransaction.to_string(),
            "Cannot start nested transaction"
        );
    }

    #[test]
    fn column_mismatch_names_row_and_counts() {
        let err = LoaderError::ColumnCountMismatch {
            table: "events".to_string(),
            row: 4,
            expected: 3,
            actual: 2,
        };
        let message = err.to_string();
        assert!(message.contains("row 4"));
        assert!(message.contains("expected 3"));
        assert!(message.contains("has 2 values"));
    }
}
