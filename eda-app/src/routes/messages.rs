use crate::server::ApiState;
use crate::store::{ReceivedMessage, ReceivedQuery};
use axum::extract::Query;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use eda_ai::SessionMessageRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

const PLATFORMS: &[&str] = &["whatsapp", "telegram", "simulator"];

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: String,
    pub session_id: String,
    /// Base64-encoded OGG audio.
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SendMessageResponse {
    pub result: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ReceiveParams {
    pub user_id: Option<String>,
    pub platform: Option<String>,
    /// Defaults to 50, capped at 500.
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReceiveResponse {
    pub messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Every failure on these routes is a 400 with `{error}`.
pub struct ApiError(String);

impl ApiError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "messaging request failed");
        (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: self.0 })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<eda_ai::AiError> for ApiError {
    fn from(e: eda_ai::AiError) -> Self {
        Self(e.to_string())
    }
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/receive", get(receive_messages))
}

#[utoipa::path(
    post,
    path = "/api/messages/send",
    tag = "Messages",
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "AI reply for the message", body = SendMessageResponse),
        (status = 400, description = "Invalid payload or processing failure", body = ErrorResponse)
    )
)]
#[tracing::instrument(level = "info", skip_all)]
pub async fn send_message(
    Extension(state): Extension<Arc<ApiState>>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::new(e.body_text()))?;

    let user_id = state.store.get_or_create_user(&req.session_id).await?;
    tracing::info!(session_id = %req.session_id, user_id = %user_id, "processing api message");

    let audio = match req.audio.as_deref() {
        Some(encoded) => Some(Bytes::from(STANDARD.decode(encoded).map_err(|e| {
            tracing::warn!(%e, "invalid base64 audio");
            ApiError::new("Failed to process audio data")
        })?)),
        None => None,
    };

    let history = state.store.conversation_history(&user_id).await?;
    let message_history = if history.is_empty() {
        None
    } else {
        tracing::debug!(history_len = history.len(), "attaching conversation history");
        Some(serde_json::to_value(&history).map_err(|e| ApiError::new(e.to_string()))?)
    };

    let response = state
        .ai
        .handle_session_message(SessionMessageRequest {
            message: req.message.clone(),
            session_id: user_id.clone(),
            platform: req.platform.clone(),
            message_history,
            audio,
        })
        .await?;
    let result = response.result.unwrap_or_default();

    state
        .store
        .append_exchange(&user_id, &req.message, &result)
        .await?;

    Ok(Json(SendMessageResponse {
        result,
        session_id: user_id,
    }))
}

#[utoipa::path(
    get,
    path = "/api/messages/receive",
    tag = "Messages",
    params(ReceiveParams),
    responses(
        (status = 200, description = "Received messages, newest first", body = ReceiveResponse),
        (status = 400, description = "Invalid query parameters", body = ErrorResponse)
    )
)]
#[tracing::instrument(level = "debug", skip_all)]
pub async fn receive_messages(
    Extension(state): Extension<Arc<ApiState>>,
    params: Result<Query<ReceiveParams>, QueryRejection>,
) -> Result<Json<ReceiveResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::new(e.body_text()))?;
    if let Some(platform) = params.platform.as_deref() {
        if !PLATFORMS.contains(&platform) {
            return Err(ApiError::new(format!(
                "invalid platform '{platform}'; expected one of {}",
                PLATFORMS.join(", ")
            )));
        }
    }

    let messages = state
        .store
        .list_received(ReceivedQuery {
            user_id: params.user_id,
            platform: params.platform,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;
    Ok(Json(ReceiveResponse { messages }))
}
