use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_util::{AppState, AppStateData};

pub const FREE_READS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Liveness probe, independent of the quota backend
pub async fn ok_handler() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Version, active backend and outcome counters since startup
pub async fn status_handler(
    State(AppStateData { quota_engine, .. }): AppState,
) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": FREE_READS_VERSION,
        "backend": quota_engine.backend_kind(),
        "quota": quota_engine.metrics().snapshot(),
    }))
}

/// Readiness probe: fails while the active quota backend cannot be reached
pub async fn health_handler(State(AppStateData { quota_engine, .. }): AppState) -> Response {
    let backend = quota_engine.backend_kind();
    match quota_engine.health_check().await {
        Ok(()) => Json(json!({ "gateway": "ok", "backend": backend })).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "gateway": "ok", "backend": backend, "status": "unavailable" })),
        )
            .into_response(),
    }
}
