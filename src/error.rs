//! Error types for the execution layer.
//!
//! This module defines all error types using `thiserror`. Variants follow the
//! failure taxonomy of the layer: configuration mistakes are caught before any
//! I/O, acquisition failures mean no connection was ever leased, execution
//! failures mean a leased connection ran the statement and it failed, and
//! transaction failures cover the BEGIN/COMMIT/ROLLBACK protocol.

use thiserror::Error;

/// Why a connection could not be leased from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKind {
    /// The pool has been closed (or is draining).
    Closed,
    /// Every connection is in use and the acquire timeout elapsed.
    Exhausted,
    /// The backing store could not be reached.
    Unreachable,
}

impl std::fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "pool closed"),
            Self::Exhausted => write!(f, "pool exhausted"),
            Self::Unreachable => write!(f, "backend unreachable"),
        }
    }
}

/// Coarse classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Acquisition,
    Execution,
    Transaction,
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Could not acquire connection ({kind}): {message}")]
    Acquisition {
        kind: AcquisitionKind,
        message: String,
        suggestion: String,
    },

    #[error("Statement failed: {message}")]
    Execution {
        message: String,
        /// e.g., "23505" for a unique violation on PostgreSQL
        sql_state: Option<String>,
        statement: String,
    },

    /// The session broke while `statement` was running; it may have been applied.
    #[error("Connection lost while running statement: {message}")]
    ConnectionLost { message: String, statement: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Commit failed for transaction {transaction_id}: {source}")]
    CommitFailed {
        transaction_id: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("{original} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        original: Box<DbError>,
        rollback: Box<DbError>,
    },

    #[error("Unit of work aborted: {reason}")]
    Aborted { reason: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Pool not registered: {name}")]
    PoolNotFound { name: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an acquisition error with a helpful suggestion.
    pub fn acquisition(
        kind: AcquisitionKind,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Acquisition {
            kind,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Acquisition error for a pool that no longer hands out connections.
    pub fn pool_closed(pool: &str) -> Self {
        Self::acquisition(
            AcquisitionKind::Closed,
            format!("Pool '{}' is closed", pool),
            "The application is shutting down; retrying will not help",
        )
    }

    /// Create an execution error for a failed statement.
    pub fn execution(
        message: impl Into<String>,
        sql_state: Option<String>,
        statement: impl Into<String>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            sql_state,
            statement: statement.into(),
        }
    }

    /// The connection failed underneath a running statement.
    pub fn connection_lost(message: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
            statement: statement.into(),
        }
    }

    /// Create a transaction protocol error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Wrap a COMMIT failure.
    pub fn commit_failed(transaction_id: impl Into<String>, source: DbError) -> Self {
        Self::CommitFailed {
            transaction_id: transaction_id.into(),
            source: Box::new(source),
        }
    }

    /// Attach a ROLLBACK failure to the error that triggered the rollback.
    pub fn rollback_failed(original: DbError, rollback: DbError) -> Self {
        Self::RollbackFailed {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    /// Abort a unit of work with a caller-defined reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create a pool not found error.
    pub fn pool_not_found(name: impl Into<String>) -> Self {
        Self::PoolNotFound { name: name.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a driver error raised while leasing a connection.
    pub fn from_acquire(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::acquisition(
                AcquisitionKind::Exhausted,
                "Timed out waiting for a free connection",
                "Increase max_connections or acquire_timeout, or reduce concurrent load",
            ),
            sqlx::Error::PoolClosed => Self::acquisition(
                AcquisitionKind::Closed,
                "Connection pool is closed",
                "The pool has been shut down",
            ),
            other => Self::acquisition(
                AcquisitionKind::Unreachable,
                other.to_string(),
                "Check network connectivity and database server status",
            ),
        }
    }

    /// Classify a driver error raised while running `statement`.
    ///
    /// The connection was already leased, so nothing here is an acquisition
    /// failure: transport errors become [`DbError::ConnectionLost`].
    pub fn from_execute(err: sqlx::Error, statement: &str) -> Self {
        match err {
            sqlx::Error::Database(db_err) => Self::execution(
                db_err.message(),
                db_err.code().map(|c| c.to_string()),
                statement,
            ),
            sqlx::Error::Io(io_err) => {
                Self::connection_lost(format!("I/O error: {}", io_err), statement)
            }
            sqlx::Error::Tls(tls_err) => {
                Self::connection_lost(format!("TLS error: {}", tls_err), statement)
            }
            sqlx::Error::Protocol(msg) => {
                Self::connection_lost(format!("Protocol error: {}", msg), statement)
            }
            other => match Self::from(other) {
                Self::Internal { message } => Self::execution(message, None, statement),
                classified => classified,
            },
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Acquisition { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Map this error onto the failure taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::PoolNotFound { .. } => ErrorCategory::Configuration,
            Self::Acquisition { .. } => ErrorCategory::Acquisition,
            Self::Execution { .. } | Self::ConnectionLost { .. } | Self::Timeout { .. } => {
                ErrorCategory::Execution
            }
            Self::Transaction { .. }
            | Self::CommitFailed { .. }
            | Self::RollbackFailed { .. }
            | Self::Aborted { .. } => ErrorCategory::Transaction,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Check if this error is retryable by the caller.
    ///
    /// Only failures where no statement reached the server qualify: a timed
    /// out or interrupted statement may already have been applied.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Acquisition { kind, .. } => *kind != AcquisitionKind::Closed,
            _ => false,
        }
    }

    /// True when the session that produced this error can no longer be trusted.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionLost { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => DbError::execution(
                db_err.message(),
                db_err.code().map(|c| c.to_string()),
                "",
            ),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => DbError::from_acquire(err),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                DbError::from_execute(err, "")
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = DbError::configuration("exactly one pool source is required");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_acquisition_suggestion() {
        let err = DbError::acquisition(AcquisitionKind::Exhausted, "busy", "wait");
        assert_eq!(err.suggestion(), Some("wait"));
        assert!(err.to_string().contains("pool exhausted"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(!DbError::timeout("statement execution", Duration::from_secs(1)).is_retryable());
        assert!(!DbError::connection_lost("reset", "INSERT INTO t VALUES (1)").is_retryable());
        assert!(DbError::acquisition(AcquisitionKind::Unreachable, "x", "y").is_retryable());
        assert!(!DbError::pool_closed("main").is_retryable());
        assert!(!DbError::configuration("bad").is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            DbError::configuration("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            DbError::pool_closed("main").category(),
            ErrorCategory::Acquisition
        );
        assert_eq!(
            DbError::execution("dup", Some("23505".into()), "INSERT").category(),
            ErrorCategory::Execution
        );
        assert_eq!(
            DbError::aborted("nope").category(),
            ErrorCategory::Transaction
        );
    }

    #[test]
    fn test_rollback_failure_keeps_original_first() {
        let original = DbError::execution("UNIQUE constraint failed", None, "INSERT");
        let rollback = DbError::execution("connection reset", None, "ROLLBACK");
        let err = DbError::rollback_failed(original, rollback);
        let text = err.to_string();
        assert!(text.starts_with("Statement failed: UNIQUE constraint failed"));
        assert!(text.contains("rollback also failed"));

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Statement failed: UNIQUE constraint failed")
        );
    }

    #[test]
    fn test_from_acquire_classification() {
        let err = DbError::from_acquire(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            err,
            DbError::Acquisition {
                kind: AcquisitionKind::Exhausted,
                ..
            }
        ));

        let err = DbError::from_acquire(sqlx::Error::PoolClosed);
        assert!(matches!(
            err,
            DbError::Acquisition {
                kind: AcquisitionKind::Closed,
                ..
            }
        ));
    }

    #[test]
    fn test_from_execute_keeps_statement() {
        let err = DbError::from_execute(sqlx::Error::RowNotFound, "SELECT 1");
        match err {
            DbError::Execution { statement, .. } => assert_eq!(statement, "SELECT 1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_poisons_connection() {
        assert!(DbError::timeout("statement", Duration::from_millis(5)).poisons_connection());
        assert!(!DbError::execution("x", None, "y").poisons_connection());
        assert!(!DbError::from_acquire(sqlx::Error::PoolTimedOut).poisons_connection());
    }

    #[test]
    fn test_io_error_during_statement_is_not_acquisition() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DbError::from_execute(sqlx::Error::Io(io), "INSERT INTO t VALUES (1)");

        assert_eq!(err.category(), ErrorCategory::Execution);
        assert!(!err.is_retryable());
        assert!(err.poisons_connection());
        assert!(!err.to_string().contains("Could not acquire"));
        match err {
            DbError::ConnectionLost { statement, .. } => {
                assert_eq!(statement, "INSERT INTO t VALUES (1)")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_protocol_error_during_statement_is_connection_lost() {
        let err = DbError::from_execute(
            sqlx::Error::Protocol("unexpected packet".to_string()),
            "SELECT 1",
        );
        assert!(matches!(err, DbError::ConnectionLost { .. }));
    }

    #[test]
    fn test_io_error_while_acquiring_stays_acquisition() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DbError::from_acquire(sqlx::Error::Io(io));
        assert!(matches!(
            err,
            DbError::Acquisition {
                kind: AcquisitionKind::Unreachable,
                ..
            }
        ));
        assert!(err.is_retryable());
    }
}
