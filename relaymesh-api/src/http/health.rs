//! Health check endpoints
//!
//! Provides simple health check for monitoring.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
}

/// OK while the server is serving; 503 once a fatal failure was recorded
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.supervisor.fatal_reason() {
        None => (StatusCode::OK, "OK".to_string()),
        Some(reason) => (StatusCode::SERVICE_UNAVAILABLE, format!("FATAL: {reason}")),
    }
}

/// Room, peer and resource counters
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.manager().get_stats().await)
}
