//! Query and transaction execution.
//!
//! [`Database`] is the handle callers work with. Every call leases exactly
//! one connection and gives it back before returning:
//!
//! - [`Database::query`] runs a single statement.
//! - [`Database::transact`] runs a unit of work between BEGIN and
//!   COMMIT/ROLLBACK on one connection.
//! - [`Database::acquire`] hands the lease to the caller.

use crate::db::backend::{Backend, TransactionStatements};
use crate::db::managed::{Lease, ManagedPool, PoolStatus, SessionState};
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteOptions, ExecutionResult, QueryParam, ResolvedOptions};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Progress of a transaction.
///
/// `Acquired → Begun → Running → Committing → Committed`, or
/// `Running → RollingBack → RolledBack`. `Released` is always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Acquired,
    Begun,
    Running,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Released,
}

/// A unit of work's view of an open transaction.
pub struct Transaction<B: Backend = DbPool> {
    lease: Lease<B>,
    id: String,
    state: TransactionState,
    statements: TransactionStatements,
    started: Instant,
}

impl<B: Backend> std::fmt::Debug for Transaction<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Transaction<B> {
    fn new(lease: Lease<B>, statements: TransactionStatements) -> Self {
        Self {
            lease,
            id: generate_transaction_id(),
            state: TransactionState::Acquired,
            statements,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn lease_id(&self) -> u64 {
        self.lease.id()
    }

    /// Run a statement inside the transaction.
    pub async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecutionResult> {
        let options = self.lease.defaults().clone();
        self.run_user_statement(statement, params, &options).await
    }

    pub async fn execute_with(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        overrides: &ExecuteOptions,
    ) -> DbResult<ExecutionResult> {
        let options = self.lease.defaults().merge(overrides);
        self.run_user_statement(statement, params, &options).await
    }

    async fn run_user_statement(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        options: &ResolvedOptions,
    ) -> DbResult<ExecutionResult> {
        if self.state != TransactionState::Running {
            return Err(DbError::transaction(
                format!("Cannot run statements in state {:?}", self.state),
                &self.id,
            ));
        }
        if is_transaction_control(statement) {
            return Err(DbError::transaction(
                format!(
                    "Nested transaction control is not supported: '{}'",
                    statement.trim()
                ),
                &self.id,
            ));
        }
        self.lease.execute_resolved(statement, params, options).await
    }

    async fn control(&mut self, statement: &str) -> DbResult<()> {
        let options = self.lease.defaults().clone();
        self.lease
            .execute_resolved(statement, &[], &options)
            .await
            .map(|_| ())
    }

    async fn begin(&mut self) -> DbResult<()> {
        // Marked before sending so a cancelled BEGIN is never returned to the pool
        self.lease.set_session(SessionState::InTransaction);
        let begin = self.statements.begin.clone();
        if let Err(err) = self.control(&begin).await {
            self.lease.invalidate();
            warn!(
                transaction_id = %self.id,
                pool = %self.lease.pool_label(),
                error = %err,
                "BEGIN failed"
            );
            return Err(err);
        }
        self.state = TransactionState::Begun;
        debug!(
            transaction_id = %self.id,
            pool = %self.lease.pool_label(),
            lease_id = self.lease.id(),
            "Transaction started"
        );
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.state = TransactionState::Committing;
        let commit = self.statements.commit.clone();
        self.control(&commit).await?;
        self.state = TransactionState::Committed;
        self.lease.set_session(SessionState::Idle);
        debug!(
            transaction_id = %self.id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Transaction committed"
        );
        Ok(())
    }

    /// Roll back after `original` and decide which error the caller sees.
    async fn rollback_after(&mut self, original: DbError) -> DbError {
        self.state = TransactionState::RollingBack;
        let rollback = self.statements.rollback.clone();
        match self.control(&rollback).await {
            Ok(()) => {
                self.state = TransactionState::RolledBack;
                self.lease.set_session(SessionState::Idle);
                debug!(
                    transaction_id = %self.id,
                    error = %original,
                    "Transaction rolled back"
                );
                original
            }
            Err(rollback_err) => {
                self.lease.invalidate();
                error!(
                    transaction_id = %self.id,
                    pool = %self.lease.pool_label(),
                    error = %original,
                    rollback_error = %rollback_err,
                    "ROLLBACK failed, discarding connection"
                );
                DbError::rollback_failed(original, rollback_err)
            }
        }
    }

    fn release(mut self) {
        self.state = TransactionState::Released;
        debug!(transaction_id = %self.id, "Transaction released");
        self.lease.release();
    }
}

/// True for statements that open or close a transaction.
///
/// Savepoint statements, including `ROLLBACK TO`, are allowed.
pub fn is_transaction_control(statement: &str) -> bool {
    let mut words = statement
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_uppercase);

    match words.next().as_deref() {
        Some("BEGIN") | Some("COMMIT") | Some("END") => true,
        Some("START") => words.next().as_deref() == Some("TRANSACTION"),
        Some("ROLLBACK") => {
            let next = words
                .find(|w| w != "WORK" && w != "TRANSACTION")
                .unwrap_or_default();
            next != "TO"
        }
        _ => false,
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Handle to one registered pool plus its row-shaping defaults.
pub struct Database<B: Backend = DbPool> {
    pool: Arc<ManagedPool<B>>,
    defaults: ResolvedOptions,
    name: Option<String>,
}

impl<B: Backend> Clone for Database<B> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            defaults: self.defaults.clone(),
            name: self.name.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Database<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl<B: Backend> Database<B> {
    pub fn new(pool: Arc<ManagedPool<B>>, defaults: ResolvedOptions) -> Self {
        Self {
            pool,
            defaults,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Registered slot name; `None` for the default slot.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn pool(&self) -> &Arc<ManagedPool<B>> {
        &self.pool
    }

    pub fn defaults(&self) -> &ResolvedOptions {
        &self.defaults
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Lease a connection. It is returned to the pool when the lease drops.
    pub async fn acquire(&self) -> DbResult<Lease<B>> {
        let lease = self.pool.acquire().await?;
        Ok(lease.with_defaults(self.defaults.clone()))
    }

    /// Run one statement on its own connection.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecutionResult> {
        self.query_with(sql, params, &ExecuteOptions::default()).await
    }

    pub async fn query_with(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: &ExecuteOptions,
    ) -> DbResult<ExecutionResult> {
        let mut lease = self.acquire().await?;
        let result = lease.execute_with(sql, params, options).await;
        lease.release();
        result
    }

    /// Run `work` inside a transaction.
    ///
    /// The transaction commits when `work` succeeds and rolls back when it
    /// fails; the error `work` returned is passed through unchanged. A failed
    /// COMMIT is reported as [`DbError::CommitFailed`], a failed ROLLBACK as
    /// [`DbError::RollbackFailed`] with the original error kept first.
    ///
    /// ```ignore
    /// let id = db
    ///     .transact(|tx| {
    ///         Box::pin(async move {
    ///             tx.execute("INSERT INTO users (name) VALUES (?)", &["ada".into()])
    ///                 .await?;
    ///             let row = tx.execute("SELECT last_insert_rowid() AS id", &[]).await?;
    ///             Ok(row.first_value("id").cloned())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transact<T, F>(&self, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction<B>) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let lease = self.acquire().await?;
        let mut tx = Transaction::new(lease, self.pool.backend().transaction_statements());
        tx.begin().await?;

        tx.state = TransactionState::Running;
        let result = match work(&mut tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(commit_err) => {
                    let err = DbError::commit_failed(tx.id.clone(), commit_err);
                    Err(tx.rollback_after(err).await)
                }
            },
            Err(err) => Err(tx.rollback_after(err).await),
        };

        tx.release();
        result
    }
}
