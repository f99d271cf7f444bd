//! HTTP status endpoint for the bounce worker.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use crate::pipeline::scheduler::BounceWorker;

/// Build the Axum router with health, status and manual-trigger routes.
pub fn status_routes(worker: Arc<BounceWorker>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/run", post(run_now))
        .with_state(worker)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "bounce-relay",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(worker): State<Arc<BounceWorker>>) -> impl IntoResponse {
    Json(worker.status().await)
}

/// Runs a pass immediately and returns its report. Waits for any
/// scheduled pass that is already running.
async fn run_now(State(worker): State<Arc<BounceWorker>>) -> impl IntoResponse {
    info!("Manual bounce run triggered");
    Json(worker.trigger().await)
}
