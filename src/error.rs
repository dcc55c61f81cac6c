//! Centralized error types for flowgate

use thiserror::Error;

/// Load-balancer error types
#[derive(Debug, Error)]
pub enum LbError {
    /// Configuration parsing or validation failed (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request carried an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The client exhausted its token bucket
    #[error("Rate limit exceeded ({remaining} tokens remaining)")]
    RateLimitExceeded {
        /// Tokens left in the bucket after the denied take
        remaining: i64,
    },

    /// No healthy backend is available
    #[error("no backends available")]
    NoBackends,

    /// Forwarding to the selected backend failed
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// The rate-limit store is unreachable or misbehaving
    #[error("Storage error: {0}")]
    Store(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LbError {
    /// Whether the error is a transient storage-level failure that a caller
    /// may retry. Policy denials and argument errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LbError::Store(_) | LbError::Io(_))
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, LbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = LbError::Config("no backends configured".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: no backends configured"
        );
    }

    #[test]
    fn test_error_display_rate_limit() {
        let err = LbError::RateLimitExceeded { remaining: 3 };
        assert_eq!(err.to_string(), "Rate limit exceeded (3 tokens remaining)");
    }

    #[test]
    fn test_error_display_no_backends() {
        assert_eq!(LbError::NoBackends.to_string(), "no backends available");
    }

    #[test]
    fn test_error_display_store() {
        let err = LbError::Store("connection refused".into());
        assert_eq!(err.to_string(), "Storage error: connection refused");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LbError::Store("timeout".into()).is_retryable());
        assert!(!LbError::RateLimitExceeded { remaining: 0 }.is_retryable());
        assert!(!LbError::InvalidArgument("bad".into()).is_retryable());
        assert!(!LbError::NoBackends.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: LbError = io_err.into();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LbError>();
    }
}
