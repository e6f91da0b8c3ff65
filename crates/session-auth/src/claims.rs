//! Access-token expiry decoding
//!
//! Access tokens are JWTs. Only the `exp` claim is read, and the signature is
//! never verified: the backend is the authority, this is purely for deciding
//! when to refresh.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<u64>,
}

/// Read the `exp` claim (unix seconds) from a JWT.
///
/// Returns `None` for opaque tokens, malformed payloads, or a missing claim.
pub fn expires_at(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    // Some issuers keep base64 padding; the URL-safe engine rejects it.
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<ExpiryClaim>(&bytes).ok()?.exp
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Delay until the preemptive refresh should fire.
///
/// `None` if the token has already expired. Otherwise `ratio` of the
/// remaining lifetime, never shorter than `min_delay`.
pub fn refresh_delay(exp: u64, now: u64, ratio: f64, min_delay: Duration) -> Option<Duration> {
    if exp <= now {
        return None;
    }
    let ttl = Duration::from_secs(exp - now);
    Some(ttl.mul_f64(ratio).max(min_delay))
}
