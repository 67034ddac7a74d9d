//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    /// Walks currently in the registry
    pub walks: usize,
    /// Samples waiting for upload across all walks
    pub buffered_samples: Option<u64>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let buffered_samples = match state.tracker.buffer().total_len().await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read sample buffer");
            None
        }
    };

    Json(HealthResponse {
        status: if buffered_samples.is_some() { "ok" } else { "degraded" }.to_string(),
        module: "pawtrail-tracker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        walks: state.tracker.registry().len().await,
        buffered_samples,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
