// src/error.rs
//! Handler error type.
//!
//! Upstream failures are logged in full and answered with a generic body;
//! nothing from the completions endpoint or the identity provider reaches
//! the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::message::ErrorResponse;
use crate::services::completions::CompletionError;

pub const MESSAGE_REQUIRED: &str = "Message is required";
pub const INVALID_BODY: &str = "Invalid JSON body";
pub const INTERNAL_ERROR: &str = "Internal error";
pub const NOT_FOUND: &str = "Not found";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Completion(#[from] CompletionError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::NotFound => (StatusCode::NOT_FOUND, NOT_FOUND.to_string()),
            AppError::Completion(e) => {
                error!(error = %e, "chat completion failed");
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
