use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use parley_core::ids::SessionId;
use parley_core::errors::UpstreamError;
use parley_store::StoreError;

/// Failure of a chat turn, on either delivery path.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// The upstream call failed after the user message was stored.
    #[error("upstream failed for session {session_id}: {error}")]
    Upstream {
        session_id: SessionId,
        error: UpstreamError,
    },
}

/// Plain HTTP error with a `{"error": message}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{resource} not found"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::not_found(&what),
            other => {
                tracing::error!(error = %other, "storage error");
                Self::internal("storage unavailable")
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(message) => ApiError::bad_request(message).into_response(),
            Self::Persistence(err) => ApiError::from(err).into_response(),
            Self::Upstream { session_id, error } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "reply": error.user_message(), "sessionId": session_id })),
            )
                .into_response(),
        }
    }
}
