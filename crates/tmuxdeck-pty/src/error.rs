use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying process could not be created. The session is never registered.
    #[error("failed to spawn session process: {0}")]
    Spawn(String),
    #[error("session not found: {0}")]
    NotFound(String),
    /// The session is still registered (exit echo window) but its process is gone.
    #[error("process not found: {0}")]
    ProcessGone(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Short, stable error string for the `{ ok: false, error }` envelope.
    pub fn wire_message(&self) -> String {
        match self {
            SessionError::NotFound(_) => "not found".to_string(),
            SessionError::ProcessGone(_) => "process not found".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::ProcessGone(_) => StatusCode::GONE,
            SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            ok: false,
            error: self.wire_message(),
        };

        (status, Json(body)).into_response()
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
