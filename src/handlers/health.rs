//! `/health` and `/ready` probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::AppState;

/// Always `200 OK` once the process is up — liveness, not readiness.
pub async fn health() -> impl axum::response::IntoResponse {
    StatusCode::OK
}

/// `200 OK` once every configured Source has completed at least one poll
/// cycle (or immediately if there are no Sources), `503` otherwise —
/// readiness, so a load balancer doesn't route webhook traffic to an
/// instance that hasn't reconciled its initial alert set yet.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl axum::response::IntoResponse {
    if state.poller.all_ready() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "ready": false })))
    }
}
