//! Lease bookkeeping and bounded drain around a [`Backend`].
//!
//! [`ManagedPool`] counts every connection it hands out. State changes go
//! through a `watch` channel so that acquire, release and close are
//! serialized and `close` can wait for the outstanding count to reach zero.
//!
//! A [`Lease`] is released exactly once: explicitly via [`Lease::release`] or
//! when it is dropped. Leases dropped mid-transaction, or marked invalid, are
//! discarded instead of being returned to the backend.

use crate::db::backend::{Backend, BackendConnection, BackendStats};
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteOptions, ExecutionResult, QueryParam, ResolvedOptions};
use futures_util::FutureExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Extra time granted to the backend to close once the pool has drained.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Bookkeeping shared by acquire, release and close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolState {
    pub outstanding: usize,
    pub acquired_total: u64,
    pub released_total: u64,
    pub closed: bool,
}

/// Snapshot of a pool for status output.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub label: String,
    pub backend: &'static str,
    #[serde(flatten)]
    pub state: PoolState,
    #[serde(flatten)]
    pub stats: BackendStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every lease was released before the deadline.
    Drained,
    /// The deadline passed with leases still out; the backend was closed anyway.
    Forced { outstanding: usize },
    /// A previous close already ran.
    AlreadyClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub label: String,
    pub outcome: DrainOutcome,
    pub elapsed: Duration,
}

/// Session state of a leased connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    InTransaction,
}

pub struct ManagedPool<B: Backend> {
    backend: B,
    label: String,
    state: watch::Sender<PoolState>,
    next_lease: AtomicU64,
}

impl<B: Backend> std::fmt::Debug for ManagedPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedPool")
            .field("label", &self.label)
            .field("backend", &self.backend.kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> ManagedPool<B> {
    pub fn new(label: impl Into<String>, backend: B) -> Self {
        let (state, _) = watch::channel(PoolState::default());
        Self {
            backend,
            label: label.into(),
            state,
            next_lease: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            label: self.label.clone(),
            backend: self.backend.kind(),
            state: self.state(),
            stats: self.backend.stats(),
        }
    }

    /// Lease one connection.
    ///
    /// Counters move only once the backend has produced a connection, so a
    /// caller cancelled while waiting leaves no trace.
    pub async fn acquire(self: &Arc<Self>) -> DbResult<Lease<B>> {
        if self.is_closed() {
            return Err(DbError::pool_closed(&self.label));
        }

        let connection = self.backend.acquire().await?;

        let mut admitted = false;
        self.state.send_modify(|state| {
            if !state.closed {
                state.outstanding += 1;
                state.acquired_total += 1;
                admitted = true;
            }
        });
        if !admitted {
            // Closed while we were waiting on the backend
            self.backend.release(connection);
            return Err(DbError::pool_closed(&self.label));
        }

        let id = self.next_lease.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(pool = %self.label, lease_id = id, "Connection leased");
        Ok(Lease {
            connection: Some(connection),
            pool: Arc::clone(self),
            id,
            session: SessionState::Idle,
            invalid: false,
            defaults: ResolvedOptions::default(),
        })
    }

    fn finish_lease(&self, connection: B::Connection, discard: bool) {
        if discard {
            self.backend.discard(connection);
        } else {
            self.backend.release(connection);
        }
        self.state.send_modify(|state| {
            state.outstanding = state.outstanding.saturating_sub(1);
            state.released_total += 1;
        });
    }

    /// Stop handing out leases, wait up to `drain_time` for outstanding ones,
    /// then close the backend.
    ///
    /// When the deadline passes the backend is closed without waiting further;
    /// in-flight work keeps its connection until its lease is released.
    pub async fn close(&self, drain_time: Duration) -> DrainReport {
        let start = Instant::now();

        let mut already_closed = false;
        self.state.send_modify(|state| {
            already_closed = state.closed;
            state.closed = true;
        });
        if already_closed {
            return DrainReport {
                label: self.label.clone(),
                outcome: DrainOutcome::AlreadyClosed,
                elapsed: start.elapsed(),
            };
        }

        info!(
            pool = %self.label,
            outstanding = self.state().outstanding,
            drain_ms = drain_time.as_millis() as u64,
            "Draining pool"
        );

        let mut rx = self.state.subscribe();
        let drained = timeout(drain_time, rx.wait_for(|state| state.outstanding == 0))
            .await
            .is_ok();

        let outcome = if drained {
            let window = drain_time.saturating_sub(start.elapsed()) + CLOSE_GRACE;
            if timeout(window, self.backend.close()).await.is_err() {
                warn!(pool = %self.label, "Backend did not finish closing in time");
            }
            DrainOutcome::Drained
        } else {
            let outstanding = self.state().outstanding;
            warn!(
                pool = %self.label,
                outstanding,
                "Drain deadline passed, closing with connections still leased"
            );
            // Poll the close once so the backend marks itself closed, then
            // leave the stragglers behind
            let _ = self.backend.close().now_or_never();
            DrainOutcome::Forced { outstanding }
        };

        let elapsed = start.elapsed();
        info!(
            pool = %self.label,
            elapsed_ms = elapsed.as_millis() as u64,
            outcome = ?outcome,
            "Pool closed"
        );
        DrainReport {
            label: self.label.clone(),
            outcome,
            elapsed,
        }
    }
}

/// Exclusive handle to one backend connection.
pub struct Lease<B: Backend> {
    connection: Option<B::Connection>,
    pool: Arc<ManagedPool<B>>,
    id: u64,
    session: SessionState,
    invalid: bool,
    defaults: ResolvedOptions,
}

impl<B: Backend> std::fmt::Debug for Lease<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.label())
            .field("id", &self.id)
            .field("session", &self.session)
            .field("invalid", &self.invalid)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Lease<B> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_label(&self) -> &str {
        self.pool.label()
    }

    pub fn session_state(&self) -> SessionState {
        self.session
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Options applied when a call does not override them.
    pub fn defaults(&self) -> &ResolvedOptions {
        &self.defaults
    }

    /// Mark the connection as unusable; it will be discarded on release.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub(crate) fn with_defaults(mut self, defaults: ResolvedOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub(crate) fn set_session(&mut self, session: SessionState) {
        self.session = session;
    }

    pub async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecutionResult> {
        let options = self.defaults.clone();
        self.execute_resolved(statement, params, &options).await
    }

    pub async fn execute_with(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        overrides: &ExecuteOptions,
    ) -> DbResult<ExecutionResult> {
        let options = self.defaults.merge(overrides);
        self.execute_resolved(statement, params, &options).await
    }

    pub(crate) async fn execute_resolved(
        &mut self,
        statement: &str,
        params: &[QueryParam],
        options: &ResolvedOptions,
    ) -> DbResult<ExecutionResult> {
        if self.invalid {
            return Err(DbError::internal(
                "Connection was invalidated and can no longer run statements",
            ));
        }
        debug!(
            pool = %self.pool.label(),
            lease_id = self.id,
            sql = %statement,
            params = params.len(),
            "Executing statement"
        );

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DbError::internal("Lease has already been released"))?;

        let result = match options.timeout {
            Some(limit) => match timeout(limit, connection.execute(statement, params, options)).await
            {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout("statement execution", limit)),
            },
            None => connection.execute(statement, params, options).await,
        };

        if let Err(err) = &result {
            if err.poisons_connection() {
                warn!(
                    pool = %self.pool.label(),
                    lease_id = self.id,
                    error = %err,
                    "Connection state unknown, it will be discarded"
                );
                self.invalid = true;
            }
        }
        result
    }

    /// Return the connection now instead of at drop.
    pub fn release(self) {
        drop(self);
    }
}

impl<B: Backend> Drop for Lease<B> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let discard = self.invalid || self.session == SessionState::InTransaction;
        if discard {
            warn!(
                pool = %self.pool.label(),
                lease_id = self.id,
                in_transaction = self.session == SessionState::InTransaction,
                "Discarding connection instead of returning it to the pool"
            );
        } else {
            debug!(pool = %self.pool.label(), lease_id = self.id, "Connection released");
        }
        self.pool.finish_lease(connection, discard);
    }
}
