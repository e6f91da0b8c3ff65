//! Auth endpoint layout and refresh policy defaults

use std::time::Duration;

/// Path prefix of the backend auth namespace. Requests under it never
/// trigger the 401 refresh-retry protocol.
pub const AUTH_PREFIX: &str = "/auth";

/// Refresh-token exchange endpoint (relative to the API base URL)
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Fraction of an access token's remaining lifetime after which the
/// preemptive refresh fires.
pub const DEFAULT_PREEMPTIVE_RATIO: f64 = 0.8;

/// Lower bound on the preemptive refresh delay.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on one refresh exchange. A stalled refresh endpoint would
/// otherwise hold every 401-recovering request indefinitely.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
