use std::time::Duration;
use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the admission-control core
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether the error means the counting backend could not be reached at all,
    /// as opposed to a failure reported by a reachable backend.
    pub fn is_unavailable(&self) -> bool {
        match self {
            RateLimitError::StoreUnavailable(_) | RateLimitError::Timeout(_) => true,
            RateLimitError::Redis(e) => e.is_io_error() || e.is_connection_refusal() || e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(RateLimitError::StoreUnavailable("down".into()).is_unavailable());
        assert!(RateLimitError::Timeout(Duration::from_millis(5)).is_unavailable());
        assert!(!RateLimitError::Config("bad".into()).is_unavailable());
    }

    #[test]
    fn test_display() {
        let err = RateLimitError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Store operation timed out after 250ms");
    }
}
