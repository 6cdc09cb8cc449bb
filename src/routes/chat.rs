// src/routes/chat.rs
use axum::{Json, body::Bytes, extract::State};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, INVALID_BODY, MESSAGE_REQUIRED},
    message::{ChatRequest, ChatResponse},
    state::SharedState,
};

pub async fn chat_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<ChatResponse>, AppError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);

    async move {
        let payload: ChatRequest = serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "rejecting unparseable chat body");
            AppError::BadRequest(INVALID_BODY.to_string())
        })?;

        let message = payload
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| AppError::BadRequest(MESSAGE_REQUIRED.to_string()))?;

        info!(chars = message.chars().count(), "relaying chat message");
        let reply = state.completions.complete(&message).await?;

        Ok(Json(ChatResponse { reply }))
    }
    .instrument(span)
    .await
}
