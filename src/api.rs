//! HTTP server for health and metrics endpoints
//!
//! - GET /health  - queue counts and chain checkpoints (JSON)
//! - GET /healthz - liveness
//! - GET /metrics - Prometheus metrics

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::{Result, WrapErr};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics;
use crate::store::{CheckpointStore, StatusCounts};
use crate::types::ChainCheckpoint;

#[derive(Clone)]
struct AppState {
    store: CheckpointStore,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub commits: StatusCounts,
    pub checkpoints: Vec<ChainCheckpoint>,
    /// Deposits the reconciler gave up on
    pub parked_deposits: i64,
}

/// Build the health snapshot from the store
pub async fn health_snapshot(store: &CheckpointStore) -> Result<HealthResponse> {
    let commits = store.status_counts().await?;
    let checkpoints = store.list_checkpoints().await?;
    let parked_deposits = store.parked_deposits().await?;
    Ok(HealthResponse {
        status: "healthy".to_string(),
        commits,
        checkpoints,
        parked_deposits,
    })
}

async fn health_check(State(state): State<AppState>) -> Response {
    match health_snapshot(&state.store).await {
        Ok(health) => Json(health).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

async fn liveness() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

/// Serve health and metrics until cancelled
pub async fn serve(addr: SocketAddr, store: CheckpointStore, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(AppState { store });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;
    info!(%addr, "Health server listening");

    metrics::UP.set(1.0);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .wrap_err("Health server failed")?;
    metrics::UP.set(0.0);

    Ok(())
}
