use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::gateway::GatewayError;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by route handlers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable,
    Internal,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Validation(msg) => ApiError::BadRequest(msg),
            GatewayError::NotFound(id) => ApiError::NotFound(format!("job {} not found", id)),
            GatewayError::Queue(e) => {
                tracing::error!(error = %e, "Queue error while handling request");
                ApiError::Unavailable
            }
            GatewayError::Registry(e) => {
                tracing::error!(error = %e, "Registry error while handling request");
                ApiError::Internal
            }
            GatewayError::Storage(e) => {
                tracing::error!(error = %e, "Storage error while handling request");
                ApiError::Internal
            }
            GatewayError::CorruptResult(e) => {
                tracing::error!(error = %e, "Unreadable result while handling request");
                ApiError::Internal
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
