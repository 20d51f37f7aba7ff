//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use choreography::ChoreographyError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Choreography error raised while handling the request.
    Choreography(ChoreographyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Choreography(err) => choreography_error_to_response(err),
        };

        let body = serde_json::json!({ "status": "error", "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn choreography_error_to_response(err: ChoreographyError) -> (StatusCode, String) {
    match &err {
        ChoreographyError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        ChoreographyError::Broker(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
        _ => {
            tracing::error!(error = %err, "internal server error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<ChoreographyError> for ApiError {
    fn from(err: ChoreographyError) -> Self {
        ApiError::Choreography(err)
    }
}
