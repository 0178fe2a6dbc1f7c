use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use pinpoint_core::error::GameError;

/// REST-facing error. Wraps the domain taxonomy and picks the HTTP status.
#[derive(Debug)]
pub struct AppError(pub GameError);

impl From<GameError> for AppError {
    fn from(e: GameError) -> Self {
        Self(e)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GameError::NotFound(_) => StatusCode::NOT_FOUND,
            GameError::Conflict(_) | GameError::Full | GameError::AlreadyStarted => {
                StatusCode::CONFLICT
            },
            GameError::InvalidState(_) => StatusCode::CONFLICT,
            GameError::Expired => StatusCode::GONE,
            GameError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GameError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            GameError::Transient(_) | GameError::StorageUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            GameError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string(), "code": self.0.code() })),
        )
            .into_response()
    }
}
