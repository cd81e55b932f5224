//! Capability traits for the store behind a managed pool.
//!
//! A backend hands out connections, takes them back and can be closed. The
//! stock implementation is [`DbPool`](crate::db::DbPool); callers may supply
//! their own already-open handle by implementing [`Backend`].

use crate::error::DbResult;
use crate::models::{ExecutionResult, PoolParams, QueryParam, ResolvedOptions};
use std::future::Future;

/// Connection counts reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BackendStats {
    /// Open connections, leased or idle
    pub size: u32,
    pub idle: u32,
}

/// Statements used to delimit a transaction on a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStatements {
    pub begin: String,
    pub commit: String,
    pub rollback: String,
}

impl TransactionStatements {
    pub fn new(
        begin: impl Into<String>,
        commit: impl Into<String>,
        rollback: impl Into<String>,
    ) -> Self {
        Self {
            begin: begin.into(),
            commit: commit.into(),
            rollback: rollback.into(),
        }
    }
}

impl Default for TransactionStatements {
    fn default() -> Self {
        Self::new("BEGIN", "COMMIT", "ROLLBACK")
    }
}

/// One leased session able to run statements.
pub trait BackendConnection: Send + 'static {
    /// Run one statement with positional parameters.
    fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        options: &ResolvedOptions,
    ) -> impl Future<Output = DbResult<ExecutionResult>> + Send;
}

/// A pool-like source of connections.
pub trait Backend: Send + Sync + 'static {
    type Connection: BackendConnection;

    /// Lease a connection, waiting for one to become free.
    fn acquire(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Return a healthy connection for reuse.
    fn release(&self, connection: Self::Connection);

    /// Drop a connection whose session state is unknown.
    fn discard(&self, connection: Self::Connection) {
        self.release(connection);
    }

    /// Close the backend. Resolves once its connections are closed.
    fn close(&self) -> impl Future<Output = ()> + Send;

    fn stats(&self) -> BackendStats;

    /// Short backend name for logs and status output.
    fn kind(&self) -> &'static str;

    fn transaction_statements(&self) -> TransactionStatements {
        TransactionStatements::default()
    }
}

/// Backends that can be created from [`PoolParams`].
pub trait Connect: Backend + Sized {
    fn connect(params: &PoolParams) -> impl Future<Output = DbResult<Self>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transaction_statements() {
        let statements = TransactionStatements::default();
        assert_eq!(statements.begin, "BEGIN");
        assert_eq!(statements.commit, "COMMIT");
        assert_eq!(statements.rollback, "ROLLBACK");
    }
}
