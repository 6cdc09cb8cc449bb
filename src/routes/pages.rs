// src/routes/pages.rs
use axum::{Json, extract::State, response::Html};

use crate::{error::AppError, message::HealthResponse, state::SharedState};

pub async fn index_handler(State(state): State<SharedState>) -> Html<String> {
    Html(state.index_page.html().to_string())
}

// Liveness only; never touches the upstream.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn not_found_handler() -> AppError {
    AppError::NotFound
}
