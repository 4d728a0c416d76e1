//! HTTP status server: `/health`, `/stats` and `/metrics`.
//!
//! Handlers only read [`SharedState`]; nothing here touches the processing loop.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::state::{Dependency, SharedState};

const COUNT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Binds the status port, so startup fails when it is taken
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding status server to {addr}"))?;
    info!(%addr, "status server listening");
    Ok(listener)
}

/// Serves until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<SharedState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("status server")
}

async fn health_handler(State(state): State<Arc<SharedState>>) -> Response {
    let report = state.health();
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn stats_handler(State(state): State<Arc<SharedState>>) -> Response {
    let store = match state.store() {
        Some(store) if state.is_connected(Dependency::MongoDb) => store,
        _ => return (StatusCode::OK, Json(state.stats(0))).into_response(),
    };
    let count = match timeout(COUNT_TIMEOUT, store.count()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("counting documents timed out after {COUNT_TIMEOUT:?}")),
    };
    match count {
        Ok(total) => (StatusCode::OK, Json(state.stats(total))).into_response(),
        Err(e) => {
            error!(error = %e, "stats query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e }))).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<SharedState>>) -> Response {
    debug!("metrics endpoint called");
    match state.metrics().encode() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", prometheus::TEXT_FORMAT)],
            metrics,
        )
            .into_response(),
        Err(e) => {
            error!("failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}
