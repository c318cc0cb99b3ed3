//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::relay::SessionSummary;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    /// False means every live session will be refused with 1011
    pub upstream_configured: bool,
}

/// Liveness probe plus relay status
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let upstream_configured = state.manager.is_upstream_configured();
    Json(HealthResponse {
        status: if upstream_configured { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.manager.registry().len().await,
        upstream_configured,
    })
}

/// Live sessions
async fn sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.registry().snapshot().await)
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/sessions", get(sessions))
        .with_state(state)
}
