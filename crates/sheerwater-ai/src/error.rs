//! Error types for sheerwater-ai

use thiserror::Error;

/// Result type alias using sheerwater-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the model provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error {status}: {message} (type: {error_type})")]
    Api {
        status: u16,
        error_type: String,
        message: String,
    },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Error {
    /// Create an API error from status, type and message
    pub fn api(status: u16, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Timeouts, connection failures and 5xx responses are transient.
    /// Client errors (bad request, auth, rate limit) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Error::Api { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_server_errors() {
        assert!(Error::api(500, "api_error", "Internal server error").is_retryable());
        assert!(Error::api(503, "api_error", "Service unavailable").is_retryable());
        assert!(Error::api(529, "overloaded_error", "Overloaded").is_retryable());
    }

    #[test]
    fn test_retryable_timeout() {
        assert!(Error::Timeout.is_retryable());
    }

    #[test]
    fn test_not_retryable_client_errors() {
        assert!(!Error::api(400, "invalid_request_error", "Bad request").is_retryable());
        assert!(!Error::api(404, "not_found_error", "Unknown model").is_retryable());
        assert!(!Error::Auth("invalid x-api-key".into()).is_retryable());
        assert!(!Error::RateLimited { retry_after: Some(30) }.is_retryable());
    }

    #[test]
    fn test_not_retryable_malformed() {
        assert!(!Error::UnexpectedResponse("no content".into()).is_retryable());
        assert!(!Error::InvalidApiKey.is_retryable());
    }

    #[test]
    fn test_api_error_display_includes_status() {
        let e = Error::api(502, "api_error", "Bad gateway");
        assert_eq!(e.to_string(), "API error 502: Bad gateway (type: api_error)");
    }
}
