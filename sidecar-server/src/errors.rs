//! HTTP error shim for the trigger-ingress route. Bodies are a small JSON
//! envelope; status codes follow spec §7: 400 for a malformed trigger body,
//! 500 for anything that kept a tick or a handler from completing.

use std::fmt;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

use sidecar_core::broker::DispatchError;
use sidecar_core::{CodecError, HandlerError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({"error": {"message": self.message, "status": self.status.as_u16()}}));
        (self.status, body).into_response()
    }
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<HandlerError> for AppError {
    fn from(err: HandlerError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
