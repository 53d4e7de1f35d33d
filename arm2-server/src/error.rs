//! Maps domain errors to the `{error, message, code}` HTTP response shape. Never leaks an
//! internal error type's `Debug` representation to a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        };
        (status, Json(ErrorBody { error, message, code: status.as_u16() })).into_response()
    }
}

impl From<arm2_core::asm::AsmError> for ApiError {
    fn from(err: arm2_core::asm::AsmError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<arm2_core::memory::MemoryError> for ApiError {
    fn from(err: arm2_core::memory::MemoryError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<arm2_debug::EvalError> for ApiError {
    fn from(err: arm2_debug::EvalError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<arm2_session::ServiceError> for ApiError {
    fn from(err: arm2_session::ServiceError) -> Self {
        match err {
            arm2_session::ServiceError::Assemble(e) => ApiError::BadRequest(e.to_string()),
            arm2_session::ServiceError::Memory(e) => ApiError::BadRequest(e.to_string()),
            arm2_session::ServiceError::AlreadyRunning => {
                ApiError::BadRequest("a run is already in progress for this session".to_string())
            }
        }
    }
}
