//! Error types for the realtime supervision plane

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Service error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized ingest token")]
    Auth,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    #[error("Overloaded: {0}")]
    Overload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            Error::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::InvalidRequest(msg) | Error::Decode(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Protocol(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            Error::Overload(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => {
                tracing::error!("internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({ "detail": detail }));
        (status, body).into_response()
    }
}
