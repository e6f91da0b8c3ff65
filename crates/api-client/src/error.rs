//! Request-layer error taxonomy

use std::time::Duration;

/// Every way an `ApiClient` call can fail.
///
/// `Clone` because one deduplicated GET hands the same outcome to every
/// caller that joined it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// Transport failure: connect refused, reset, DNS, TLS
    #[error("network error: {0}")]
    Network(String),

    /// The call could not be built: bad URL, MIME type or body. Never sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Refresh exhausted, or no refresh token to try
    #[error("authentication required: {0}")]
    Authentication(String),

    #[error("rate limited on {endpoint}, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("{key} failed {failures} times in a row, retry after {}s", .retry_after.as_secs())]
    TooManyFailures {
        key: String,
        failures: u32,
        retry_after: Duration,
    },

    #[error("invalid response body: {0}")]
    Parse(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl ApiError {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "network",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Timeout(_) => "timeout",
            ApiError::Authentication(_) => "authentication",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::TooManyFailures { .. } => "too_many_failures",
            ApiError::Parse(_) => "parse",
            ApiError::Http { .. } => "http",
        }
    }

    /// HTTP status the error came from, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Build from a transport error, keeping timeouts distinct.
    pub(crate) fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(timeout)
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<endpoint_guard::Error> for ApiError {
    fn from(err: endpoint_guard::Error) -> Self {
        match err {
            endpoint_guard::Error::RateLimited {
                endpoint,
                retry_after,
            } => ApiError::RateLimited {
                endpoint,
                retry_after,
            },
            endpoint_guard::Error::TooManyFailures {
                key,
                failures,
                retry_after,
            } => ApiError::TooManyFailures {
                key,
                failures,
                retry_after,
            },
        }
    }
}

/// Result alias for request-layer operations.
pub type Result<T> = std::result::Result<T, ApiError>;
