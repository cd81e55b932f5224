//! Recording in-memory backend shared by the integration tests.
//!
//! Each [`MockPool`] logs every acquire, statement, release, discard and
//! close so tests can assert the exact sequence a call produced. Pools are
//! installed in a process-wide table under a unique name so that
//! `Connect::connect("mock://<name>")` finds the pool a test is watching.

#![allow(dead_code)]

use db_exec_layer::db::{Backend, BackendConnection, BackendStats, Connect};
use db_exec_layer::error::{AcquisitionKind, DbError, DbResult};
use db_exec_layer::models::{
    ColumnMetadata, ExecutionResult, PoolParams, QueryParam, ResolvedOptions,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

static POOLS: LazyLock<Mutex<HashMap<String, MockPool>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// The statement fails; the session stays usable
    Execution,
    /// The socket drops mid-statement; the session is unusable
    ConnectionLost,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<String>,
    failures: Vec<(String, Failure)>,
    delays: Vec<(String, Duration)>,
    acquire_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    connects: usize,
    leased: u32,
    next_connection: u64,
}

/// Cloneable handle; every clone shares one log.
#[derive(Debug, Clone, Default)]
pub struct MockPool {
    inner: Arc<Mutex<Inner>>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool reachable as `mock://<name>`.
    pub fn install(name: &str) -> Self {
        let pool = Self::new();
        POOLS
            .lock()
            .unwrap()
            .insert(name.to_string(), pool.clone());
        pool
    }

    pub fn url(name: &str) -> String {
        format!("mock://{}", name)
    }

    /// Fail statements starting with `prefix` (case-insensitive).
    pub fn fail_on(&self, prefix: &str, failure: Failure) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((prefix.to_ascii_uppercase(), failure));
        self
    }

    /// Delay statements starting with `prefix` (case-insensitive).
    pub fn delay_on(&self, prefix: &str, delay: Duration) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .delays
            .push((prefix.to_ascii_uppercase(), delay));
        self
    }

    pub fn delay_acquire(&self, delay: Duration) -> &Self {
        self.inner.lock().unwrap().acquire_delay = Some(delay);
        self
    }

    pub fn delay_connect(&self, delay: Duration) -> &Self {
        self.inner.lock().unwrap().connect_delay = Some(delay);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Statements sent to the backend, in order.
    pub fn statements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("execute:").map(String::from))
            .collect()
    }

    /// Lifecycle events only (no statements).
    pub fn lifecycle(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| !e.starts_with("execute:"))
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().unwrap().connects
    }

    fn record(&self, event: impl Into<String>) {
        self.inner.lock().unwrap().events.push(event.into());
    }
}

pub struct MockConnection {
    id: u64,
    pool: MockPool,
}

impl BackendConnection for MockConnection {
    async fn execute(
        &mut self,
        statement: &str,
        _params: &[QueryParam],
        options: &ResolvedOptions,
    ) -> DbResult<ExecutionResult> {
        self.pool.record(format!("execute:{}", statement));
        let upper = statement.trim().to_ascii_uppercase();

        let (delay, failure) = {
            let inner = self.pool.inner.lock().unwrap();
            let delay = inner
                .delays
                .iter()
                .find(|(prefix, _)| upper.starts_with(prefix))
                .map(|(_, d)| *d);
            let failure = inner
                .failures
                .iter()
                .find(|(prefix, _)| upper.starts_with(prefix))
                .map(|(_, f)| *f);
            (delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(Failure::Execution) => {
                return Err(DbError::execution(
                    format!("mock failure on connection {}", self.id),
                    Some("23000".to_string()),
                    statement,
                ));
            }
            Some(Failure::ConnectionLost) => {
                return Err(DbError::connection_lost(
                    format!("connection {} reset by peer", self.id),
                    statement,
                ));
            }
            None => {}
        }

        if upper.starts_with("SELECT") {
            let columns = vec![ColumnMetadata::new("1", "INTEGER", false)];
            Ok(ExecutionResult::from_values(
                columns,
                vec![vec![json!(1)]],
                options.out_format,
            ))
        } else {
            Ok(ExecutionResult::write_result(1, 0))
        }
    }
}

impl Backend for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> DbResult<MockConnection> {
        let delay = self.inner.lock().unwrap().acquire_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.leased += 1;
            inner.next_connection += 1;
            inner.events.push("acquire".to_string());
            inner.next_connection
        };
        Ok(MockConnection {
            id,
            pool: self.clone(),
        })
    }

    fn release(&self, _connection: MockConnection) {
        let mut inner = self.inner.lock().unwrap();
        inner.leased = inner.leased.saturating_sub(1);
        inner.events.push("release".to_string());
    }

    fn discard(&self, _connection: MockConnection) {
        let mut inner = self.inner.lock().unwrap();
        inner.leased = inner.leased.saturating_sub(1);
        inner.events.push("discard".to_string());
    }

    async fn close(&self) {
        self.record("close");
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            size: self.inner.lock().unwrap().leased,
            idle: 0,
        }
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

impl Connect for MockPool {
    async fn connect(params: &PoolParams) -> DbResult<Self> {
        let name = params
            .connection_string
            .strip_prefix("mock://")
            .ok_or_else(|| DbError::configuration("mock pools use mock://<name>"))?;
        let pool = POOLS.lock().unwrap().get(name).cloned().ok_or_else(|| {
            DbError::acquisition(
                AcquisitionKind::Unreachable,
                format!("no mock pool named '{}'", name),
                "install the pool first",
            )
        })?;
        let delay = {
            let mut inner = pool.inner.lock().unwrap();
            inner.connects += 1;
            inner.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        pool.record("connect");
        Ok(pool)
    }
}
