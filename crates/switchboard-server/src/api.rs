//! JSON control endpoints: send, broadcast, disconnect, metrics.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use switchboard_core::{ConnectionToken, RecipientId, SendError};

use crate::dispatcher::SendReport;
use crate::errors::DispatchError;
use crate::lifecycle;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub recipients: Vec<RecipientId>,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    pub recipient: RecipientId,
    pub token: ConnectionToken,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    /// `false` when the pair was not connected here; still a success.
    pub disconnected: bool,
}

/// Error body: `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("connection rejected: {0}")]
    Rejected(#[from] SendError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("metrics are disabled")]
    MetricsDisabled,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Rejected(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Dispatch(_) => StatusCode::BAD_GATEWAY,
            Self::MetricsDisabled => StatusCode::NOT_FOUND,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Rejected(e) => e.error_kind(),
            Self::Dispatch(e) => e.error_kind(),
            Self::MetricsDisabled => "metrics_disabled",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

/// POST /send
pub async fn send_handler(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendReport>, ApiError> {
    if req.recipients.is_empty() {
        return Err(ApiError::BadRequest("recipients must not be empty".into()));
    }
    let report = state
        .dispatcher
        .send_to(&req.recipients, Bytes::from(req.payload))
        .await?;
    Ok(Json(report))
}

/// POST /broadcast
pub async fn broadcast_handler(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<SendReport>, ApiError> {
    let report = state.dispatcher.send_all(Bytes::from(req.payload)).await?;
    Ok(Json(report))
}

/// POST /disconnect
pub async fn disconnect_handler(
    State(state): State<AppState>,
    Json(req): Json<DisconnectRequest>,
) -> Json<DisconnectResponse> {
    let disconnected = lifecycle::disconnect(&state.registry, &req.recipient, &req.token).await;
    Json(DisconnectResponse { disconnected })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state.prometheus.as_ref().ok_or(ApiError::MetricsDisabled)?;
    let body = switchboard_telemetry::metrics::render(handle);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
