//! Error types for guard checks

use std::time::Duration;

/// A guard refused the request before it reached the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rate limited on {endpoint}, retry in {}s", retry_after.as_secs())]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("too many consecutive failures on {key} ({failures})")]
    TooManyFailures {
        key: String,
        failures: u32,
        retry_after: Duration,
    },
}

/// Result alias for guard checks.
pub type Result<T> = std::result::Result<T, Error>;
