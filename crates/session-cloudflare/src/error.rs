//! Cloudflare client errors

use thiserror::Error;

/// Errors from the Cloudflare control plane.
#[derive(Debug, Error)]
pub enum CloudflareError {
    /// Transport failure, timeout, or auth rejection. Retryable.
    #[error("cloudflare unavailable: {message}")]
    Unavailable {
        /// What failed
        message: String,
    },

    /// A required argument was empty or malformed. Not retryable.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong
        message: String,
    },
}

impl CloudflareError {
    /// Create an `Unavailable` error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable {
            message: msg.into(),
        }
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Whether retrying the call later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<reqwest::Error> for CloudflareError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_retryable() {
        assert!(CloudflareError::unavailable("connection refused").is_retryable());
    }

    #[test]
    fn invalid_argument_is_not_retryable() {
        assert!(!CloudflareError::invalid_argument("sessionID is empty").is_retryable());
    }

    #[test]
    fn display_includes_message() {
        let err = CloudflareError::unavailable("timed out after 10s");
        assert!(err.to_string().contains("timed out after 10s"));

        let err = CloudflareError::invalid_argument("endpoint is empty");
        assert!(err.to_string().contains("endpoint is empty"));
    }
}
