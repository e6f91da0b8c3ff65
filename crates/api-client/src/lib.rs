//! Resilient HTTP request layer for the admin API
//!
//! `ApiClient` is the single choke point every consumer calls through. It
//! composes the session tokens from `session-auth` with the fail-fast guards
//! from `endpoint-guard`, deduplicates identical GETs, recovers a 401 with one
//! refresh-and-retry, and classifies every failure into `ApiError`.
//!
//! ```text
//! request ─► dedup (GET) ─► rate-limit check ─► breaker check ─► send
//!                                                                  │
//!     401 ─► refresh (single-flight) ─► retry once ◄───────────────┤
//!     429 ─► block endpoint, RateLimited ◄─────────────────────────┤
//!     4xx/5xx ─► failure++, Http ◄─────────────────────────────────┤
//!     2xx ─► failure reset, decode ◄───────────────────────────────┘
//! ```

mod client;
pub mod config;
pub mod error;
pub mod error_body;
pub mod metrics;
pub mod request;
pub mod response;

pub use client::ApiClient;
pub use config::ClientConfig;
pub use error::{ApiError, Result};
pub use request::{RequestBody, RequestOptions, Upload};
pub use response::Payload;
