//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::SmsError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
///
/// Bodies carry a stable error code and a generic message; internal error
/// details are logged, never returned.
#[derive(Debug)]
pub enum ApiError {
    /// The request body or path was malformed or failed validation.
    InvalidRequest(String),
    /// Resource not found.
    NotFound(String),
    /// The saga failed to accept or load the SMS.
    Processing(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Processing(err) => {
                tracing::error!(error = %err, "SMS processing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "processing_error",
                    "Failed to process SMS".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": code, "message": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<SmsError> for ApiError {
    fn from(err: SmsError) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::NotFound(_) => ApiError::NotFound("SMS not found".to_string()),
            other => ApiError::Processing(other),
        }
    }
}
