use std::time::Duration;

/// Typed failures of the upstream completion API.
///
/// Every variant keeps the raw diagnostic for logs; callers that face end users
/// go through [`UpstreamError::user_message`] instead of `Display`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Normalized text safe to show to a caller. Never includes upstream bodies.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "Generation failed: the assistant took too long to respond.",
            Self::RateLimited => "Generation failed: the assistant is busy, please try again later.",
            _ => "Generation failed: the assistant is unavailable right now.",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            UpstreamError::from_status(401, "unauthorized".into()),
            UpstreamError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            UpstreamError::from_status(400, "bad".into()),
            UpstreamError::InvalidRequest(_)
        ));
        assert!(matches!(UpstreamError::from_status(429, String::new()), UpstreamError::RateLimited));
        assert!(matches!(
            UpstreamError::from_status(503, "down".into()),
            UpstreamError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            UpstreamError::from_status(302, "moved".into()),
            UpstreamError::InvalidRequest(msg) if msg.contains("302")
        ));
    }

    #[test]
    fn user_message_hides_diagnostics() {
        let err = UpstreamError::ServerError {
            status: 500,
            body: "secret stack trace".into(),
        };
        assert!(err.to_string().contains("secret stack trace"));
        assert!(!err.user_message().contains("secret"));
    }

    #[test]
    fn timeout_classification() {
        let err = UpstreamError::Timeout(Duration::from_secs(90));
        assert!(err.is_timeout());
        assert_eq!(err.error_kind(), "timeout");
        assert!(err.user_message().contains("too long"));
        assert!(!UpstreamError::RateLimited.is_timeout());
    }
}
