// src/routes/mod.rs
pub mod chat;
pub mod pages;

use crate::state::SharedState;
use axum::{
    Router,
    routing::{get, post},
};
use chat::chat_handler;
use pages::{health_handler, index_handler, not_found_handler};
use tower_http::trace::TraceLayer;

pub fn create_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
}
