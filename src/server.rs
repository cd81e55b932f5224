//! HTTP host for the execution layer.
//!
//! The server owns the registry's lifetime: once graceful shutdown finishes,
//! every registered pool is drained exactly once.
//!
//! Routes:
//! - `GET /health`: pool statuses
//! - `POST /query`: one statement on the default or a named pool
//! - `POST /transact`: several statements in one transaction

use crate::db::{Backend, DrainReport, PoolRegistry, PoolStatus};
use crate::error::{DbError, DbResult, ErrorCategory};
use crate::models::{ExecuteOptions, ExecutionResult, QueryParam};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// How long in-flight requests may run after shutdown is requested.
pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

struct AppState<B: Backend> {
    registry: PoolRegistry<B>,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// Named pool; the default pool when omitted
    #[serde(default)]
    pub pool: Option<String>,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Deserialize)]
pub struct StatementRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

#[derive(Debug, Deserialize)]
pub struct TransactRequest {
    #[serde(default)]
    pub pool: Option<String>,
    pub statements: Vec<StatementRequest>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Serialize)]
pub struct TransactResponse {
    pub transaction_id: String,
    pub results: Vec<ExecutionResult>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pools: Vec<PoolStatus>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    category: ErrorCategory,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql_state: Option<String>,
}

impl DbError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DbError::PoolNotFound { .. } => StatusCode::NOT_FOUND,
            DbError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            other => match other.category() {
                ErrorCategory::Configuration => StatusCode::BAD_REQUEST,
                ErrorCategory::Acquisition => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCategory::Execution => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCategory::Transaction => StatusCode::CONFLICT,
                ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, status = status.as_u16(), "Request failed");
        }
        let sql_state = match &self {
            DbError::Execution { sql_state, .. } => sql_state.clone(),
            _ => None,
        };
        let body = ErrorBody {
            category: self.category(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            suggestion: self.suggestion().map(String::from),
            sql_state,
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

fn with_timeout(mut options: ExecuteOptions, timeout_ms: Option<u64>) -> ExecuteOptions {
    if let Some(ms) = timeout_ms {
        options.timeout = Some(Duration::from_millis(ms));
    }
    options
}

async fn health<B: Backend>(State(state): State<AppState<B>>) -> Json<HealthResponse> {
    let status = if state.registry.is_shut_down().await {
        "shutting_down"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        pools: state.registry.statuses().await,
    })
}

async fn query<B: Backend>(
    State(state): State<AppState<B>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<ExecutionResult>, DbError> {
    let db = state.registry.resolve(request.pool.as_deref()).await?;
    let options = with_timeout(request.options, request.timeout_ms);
    let result = db.query_with(&request.sql, &request.params, &options).await?;
    Ok(Json(result))
}

async fn transact<B: Backend>(
    State(state): State<AppState<B>>,
    Json(request): Json<TransactRequest>,
) -> Result<Json<TransactResponse>, DbError> {
    if request.statements.is_empty() {
        return Err(DbError::configuration(
            "A transaction needs at least one statement",
        ));
    }
    let db = state.registry.resolve(request.pool.as_deref()).await?;
    let options = with_timeout(request.options, request.timeout_ms);
    let statements = request.statements;

    let response = db
        .transact(move |tx| {
            Box::pin(async move {
                let mut results = Vec::with_capacity(statements.len());
                for statement in &statements {
                    results.push(
                        tx.execute_with(&statement.sql, &statement.params, &options)
                            .await?,
                    );
                }
                Ok(TransactResponse {
                    transaction_id: tx.id().to_string(),
                    results,
                })
            })
        })
        .await?;
    Ok(Json(response))
}

/// Build the router over a registry.
pub fn build_router<B: Backend>(registry: PoolRegistry<B>) -> Router {
    Router::new()
        .route("/health", get(health::<B>))
        .route("/query", post(query::<B>))
        .route("/transact", post(transact::<B>))
        .with_state(AppState { registry })
}

/// Serve until `shutdown` resolves, then drain the registry.
///
/// After shutdown is requested, in-flight requests get [`GRACEFUL_TIMEOUT`]
/// (or until a second signal) before the server is dropped. The registry is
/// drained in either case and the drain reports are returned.
pub async fn serve<B, F>(
    listener: TcpListener,
    registry: PoolRegistry<B>,
    shutdown: F,
) -> DbResult<Vec<DrainReport>>
where
    B: Backend,
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(registry.clone());
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP server listening");
    }

    // Use a notify to coordinate shutdown timing
    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let shutdown_notify_clone = shutdown_notify.clone();
    let shutdown_signal = async move {
        shutdown.await;
        shutdown_notify_clone.notify_one();
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

    let served = tokio::select! {
        result = server => {
            match result {
                Ok(()) => {
                    info!("HTTP server stopped");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "HTTP server error");
                    Err(DbError::internal(format!("HTTP server error: {}", e)))
                }
            }
        }
        _ = async {
            shutdown_notify.notified().await;
            info!(
                timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                "Waiting for in-flight requests (send signal again to force exit)..."
            );
            tokio::select! {
                _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                    warn!("Graceful shutdown timeout, forcing exit");
                }
                _ = wait_for_signal() => {
                    warn!("Received second signal, forcing immediate exit");
                }
            }
        } => Ok(()),
    };

    info!("Draining database pools");
    let reports = registry.close_all().await;
    served.map(|()| reports)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
