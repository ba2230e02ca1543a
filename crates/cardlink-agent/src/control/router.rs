//! Loopback HTTP transport for [`ControlApi`].

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use super::api::{ControlApi, EncodeRequest, PairRequest};
use crate::queue::QueueError;

/// Build the control router.
pub fn build_router(api: ControlApi) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pairing", get(pairing_status).post(pair))
        .route("/queue", get(queue_status))
        .route("/queue/replay", post(replay_queue))
        .route("/encode", post(encode_card))
        .route("/device", get(device_status))
        .with_state(api)
}

fn queue_error(e: &QueueError) -> Response {
    warn!(error = %e, "Queue operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// `GET /pairing`
async fn pairing_status(State(api): State<ControlApi>) -> impl IntoResponse {
    Json(api.pairing_status())
}

/// `POST /pairing`
async fn pair(State(api): State<ControlApi>, Json(req): Json<PairRequest>) -> impl IntoResponse {
    Json(api.pair(&req.pairing_token, &req.agent_name).await)
}

/// `GET /queue`
async fn queue_status(State(api): State<ControlApi>) -> Response {
    match api.queue_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => queue_error(&e),
    }
}

/// `POST /queue/replay`
async fn replay_queue(State(api): State<ControlApi>) -> Response {
    match api.replay_queue().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => queue_error(&e),
    }
}

/// `POST /encode`
async fn encode_card(
    State(api): State<ControlApi>,
    Json(req): Json<EncodeRequest>,
) -> impl IntoResponse {
    Json(api.encode_card(req).await)
}

/// `GET /device`
async fn device_status(State(api): State<ControlApi>) -> impl IntoResponse {
    Json(api.device_status())
}
