use std::time::Duration;

use thiserror::Error;

/// Error type for request execution.
///
/// The variants are `Clone` so that a single shared execution can fan its
/// outcome out to every call site awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The transport adapter failed to produce a response.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The configured timeout elapsed before the transport responded.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A response hook or `transform_data` rejected the raw response.
    ///
    /// Surfaced through the same channel as [`RequestError::Transport`]: a
    /// caller can only tell the two apart by inspecting the payload.
    #[error("response transform failed: {0}")]
    Transform(String),

    /// The execution was aborted before it resolved.
    #[error("request aborted")]
    Aborted,
}

impl RequestError {
    /// Returns `true` if this error represents an aborted execution.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns `true` if this error was produced by the timeout guard.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RequestError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "transport failed: connection refused");

        let err = RequestError::Timeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "request timed out after 3s");

        let err = RequestError::Transform("not json".to_string());
        assert_eq!(err.to_string(), "response transform failed: not json");

        assert_eq!(RequestError::Aborted.to_string(), "request aborted");
    }

    #[test]
    fn test_error_predicates() {
        assert!(RequestError::Aborted.is_aborted());
        assert!(!RequestError::Aborted.is_timeout());
        assert!(RequestError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!RequestError::Transport("x".to_string()).is_aborted());
    }
}
