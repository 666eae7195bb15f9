//! Service error type shared across all subsystems.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("session is not running")]
    NotRunning,

    #[error("concurrency limit reached for project {0}")]
    ConcurrencyExceeded(String),

    #[error("failed to launch browser: {0}")]
    Provisioning(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),

    #[error("context has no saved data")]
    EmptyContext,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status this error maps to at the API edge.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_)
            | Error::NotRunning
            | Error::ConcurrencyExceeded(_)
            | Error::Provisioning(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Sidecar(_) | Error::Io(_) | Error::Json(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::EmptyContext => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
