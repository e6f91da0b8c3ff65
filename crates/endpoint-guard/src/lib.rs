//! Fail-fast endpoint guards for the admin API client
//!
//! Two independent checks run before any request touches the network:
//!
//! - `RateLimiter`: an endpoint that answered 429 is blocked until its
//!   Retry-After elapses. Public endpoints are never blocked client-side.
//! - `FailureTracker`: after `threshold` consecutive failures on the same
//!   `METHOD:endpoint`, further calls are refused until a success resets the
//!   count or the periodic sweep clears it.
//!
//! Either can trip without the other. `spawn_sweep_task` runs the periodic
//! cleanup for both.

pub mod breaker;
pub mod error;
pub mod rate_limit;
pub mod sweep;

pub use breaker::FailureTracker;
pub use error::{Error, Result};
pub use rate_limit::RateLimiter;
pub use sweep::spawn_sweep_task;

/// Strip the query string: guards key on the path alone.
pub fn endpoint_path(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}
