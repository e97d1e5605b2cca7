//! HTTP surface of the replication API
//!
//! `router` is mounted on the leader and serves table listings, committed log
//! ranges, snapshots and the reset maintenance call. `maintenance_router` is
//! mounted on followers and exposes worker health and metrics.

use crate::common::{Error, Result};
use crate::replication::client::{snapshot_stream, FIRST_INDEX_HEADER};
use crate::replication::manager::Manager;
use crate::storage::engine::Engine;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ReplicationState {
    engine: Arc<Engine>,
}

/// Leader-side replication router
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/v1/tables", get(list_tables))
        .route("/v1/tables/:table/log", get(read_log))
        .route("/v1/tables/:table/snapshot", get(read_snapshot))
        .route("/v1/tables/:table/reset", post(reset_table))
        .route("/health", get(leader_health))
        .layer(TraceLayer::new_for_http())
        .with_state(ReplicationState { engine })
}

/// Follower-side health and metrics
pub fn maintenance_router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/health", get(follower_health))
        .route("/metrics", get(follower_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Serve `router` on `listener` until `cancel` fires
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!(%addr, "HTTP API stopped");
    Ok(())
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::warn!("Replication request failed: {}", self.0);
        }

        let mut response = (status, self.0.to_string()).into_response();
        if let Error::Compacted(first_index) = self.0 {
            response
                .headers_mut()
                .insert(FIRST_INDEX_HEADER, HeaderValue::from(first_index));
        }
        response
    }
}

async fn list_tables(
    State(state): State<ReplicationState>,
) -> std::result::Result<Response, ApiError> {
    let tables = state.engine.list_tables()?;
    Ok(axum::Json(tables).into_response())
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    from: u64,
    #[serde(default = "default_max_entries")]
    max: u64,
}

fn default_max_entries() -> u64 {
    1_000
}

async fn read_log(
    State(state): State<ReplicationState>,
    Path(table): Path<String>,
    Query(query): Query<LogQuery>,
) -> std::result::Result<Response, ApiError> {
    let batch = state.engine.log_reader().query(&table, query.from, query.max)?;
    let body = bincode::serialize(&batch).map_err(Error::from)?;

    tracing::debug!(
        table = %table,
        shard_id = batch.shard_id,
        from = query.from,
        entries = batch.entries.len(),
        "Served log range"
    );
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

async fn read_snapshot(
    State(state): State<ReplicationState>,
    Path(table): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let stream = snapshot_stream(&state.engine, &table).await?;
    tracing::info!(table = %table, "Serving snapshot");

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn reset_table(
    State(state): State<ReplicationState>,
    Path(table): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.engine.reset_table(&table).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leader_health(State(state): State<ReplicationState>) -> impl IntoResponse {
    match state.engine.list_tables() {
        Ok(tables) => (
            StatusCode::OK,
            axum::Json(json!({
                "status": "ok",
                "node_id": state.engine.config().node_id,
                "tables": tables.len(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

async fn follower_health(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let workers = manager.health();
    axum::Json(json!({
        "status": "ok",
        "workers": workers,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn follower_metrics(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        manager.metrics(),
    )
}
