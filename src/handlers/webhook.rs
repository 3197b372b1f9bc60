//! `POST /webhook` — pushed-alert ingestion.
//!
//! Grounded on `handlers::llm`'s `LLMApiError`/`IntoResponse` idiom: a
//! thin axum wrapper around a core method, with a dedicated error type
//! that maps to a JSON `{"error", "code"}` body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::utils::BadRequestError;
use crate::AppState;

pub struct WebhookApiError(BadRequestError);

impl From<BadRequestError> for WebhookApiError {
    fn from(err: BadRequestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for WebhookApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": StatusCode::BAD_REQUEST.as_u16(),
        }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// Accepts an Alertmanager v2 webhook payload, reconciles every alert in
/// the batch into the Store, and submits newly-firing ones for
/// enrichment before responding.
pub async fn receive(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, WebhookApiError> {
    let summary = state.webhook.ingest(&remote.ip().to_string(), &body).await?;
    Ok(Json(summary))
}
