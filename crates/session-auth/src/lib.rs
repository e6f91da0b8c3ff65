//! Session token lifecycle for the admin API
//!
//! Provides scoped token storage, the refresh-token exchange, access-token
//! expiry decoding, and the `TokenManager` every API call consults for its
//! Authorization header.
//!
//! Token flow:
//! 1. Login response handed to `TokenManager::set_tokens()` → pair persisted,
//!    preemptive refresh scheduled at 80% of the access token's lifetime
//! 2. Request path calls `TokenManager::auth_headers()` (admin scope wins)
//! 3. A 401 or the preemptive timer calls `TokenManager::refresh_token()`;
//!    concurrent callers share one in-flight exchange
//! 4. Refresh failure clears the scope's pair; the caller treats the session
//!    as expired

pub mod claims;
pub mod constants;
pub mod error;
pub mod manager;
pub mod store;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use manager::{RefreshPolicy, TokenManager};
pub use store::{Scope, TokenPair, TokenStore};
pub use token::{TokenResponse, refresh_token};
