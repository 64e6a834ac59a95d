//! API error type and helpers.
//!
//! Error bodies are `text/plain` with a short description; status mapping:
//! 400 invalid input / unknown SKID, 401 bad bearer, 404 unknown identity,
//! 409 identity exists, 500 everything internal (generic status text only,
//! details go to the log).
use axum::http::StatusCode;
use axum::response::IntoResponse;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, self.message).into_response()
    }
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

pub fn unauthorized(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::UNAUTHORIZED,
        message: message.into(),
    }
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

pub fn conflict(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::CONFLICT,
        message: message.into(),
    }
}

/// Internal errors reveal nothing to the caller; the cause is logged here.
pub fn internal(context: &str, err: &dyn std::fmt::Display) -> ApiError {
    tracing::error!(error = %err, "{context}");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: StatusCode::INTERNAL_SERVER_ERROR
            .canonical_reason()
            .unwrap_or("internal server error")
            .to_string(),
    }
}
