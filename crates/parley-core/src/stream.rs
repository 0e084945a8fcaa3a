use crate::errors::UpstreamError;

/// Events yielded by a streaming completion. Ordering contract:
///
/// TextDelta* → (Done | Error)
///
/// Nothing follows a terminal event; a stream that simply ends is
/// equivalent to `Done`.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    TextDelta { delta: String },
    Done,
    Error { error: UpstreamError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta { delta: delta.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error {
            error: UpstreamError::RateLimited
        }
        .is_terminal());
        assert!(!StreamEvent::text("x").is_terminal());
    }
}
