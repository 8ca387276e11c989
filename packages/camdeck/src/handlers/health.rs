//! Health and metrics endpoints.

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::AppState;
use crate::metrics::{HealthStatus, MetricsSnapshot, SessionHealth};

/// GET /health - readiness with a summary of live state
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthStatus> {
    let snapshot = state.metrics.snapshot();
    Json(HealthStatus {
        status: "healthy".to_string(),
        sessions: SessionHealth {
            active: snapshot.sessions.active,
        },
        connections: snapshot.connections.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// GET /health/live - bare liveness probe
pub async fn health_live_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics - full counters plus per-session detail
pub async fn metrics_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot: MetricsSnapshot = state.metrics.snapshot();
    let sessions = state.registry.snapshot().await;
    Json(json!({
        "metrics": snapshot,
        "sessions": sessions,
    }))
}
