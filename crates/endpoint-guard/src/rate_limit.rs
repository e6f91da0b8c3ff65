//! Per-endpoint rate-limit blocks
//!
//! A 429 installs (or refreshes) an "unblock at" instant for the endpoint.
//! While it lies in the future, `check_rate_limit` fails without a network
//! round trip. Entries are evicted lazily on lookup once expired, and swept
//! by `cleanup`.
//!
//! Endpoints under a public prefix are exempt: one client's block must not
//! spill over into unrelated sessions sharing a public surface, and the
//! server limits those on its own.

use std::collections::HashMap;
use std::time::Duration;

use common::{EventBus, Notice, human_wait};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint_path;
use crate::error::{Error, Result};

/// Longest block a single 429 can install. Advertised waits beyond this are
/// clamped so a bogus `Retry-After` cannot overflow the deadline.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

pub struct RateLimiter {
    blocks: RwLock<HashMap<String, Instant>>,
    public_prefixes: Vec<String>,
    default_retry_after: Duration,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(public_prefixes: Vec<String>, default_retry_after: Duration, events: EventBus) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            public_prefixes,
            default_retry_after,
            events,
        }
    }

    /// Whether the endpoint is exempt from client-side blocking.
    pub fn is_exempt(&self, endpoint: &str) -> bool {
        let path = endpoint_path(endpoint);
        self.public_prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            match path.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
    }

    /// Time left on the endpoint's block, evicting it if it has expired.
    pub async fn remaining(&self, endpoint: &str) -> Option<Duration> {
        let path = endpoint_path(endpoint);
        let now = Instant::now();
        {
            let blocks = self.blocks.read().await;
            match blocks.get(path) {
                None => return None,
                Some(until) if now < *until => return Some(*until - now),
                Some(_) => {}
            }
        }
        let mut blocks = self.blocks.write().await;
        // Re-check under the write lock: a 429 may have refreshed it meanwhile.
        match blocks.get(path) {
            Some(until) if now < *until => Some(*until - now),
            Some(_) => {
                blocks.remove(path);
                debug!(endpoint = path, "rate-limit block expired");
                None
            }
            None => None,
        }
    }

    /// True iff `now < unblock_time[endpoint]`.
    pub async fn is_blocked(&self, endpoint: &str) -> bool {
        self.remaining(endpoint).await.is_some()
    }

    /// Block the endpoint for `retry_after` from now.
    pub async fn block_endpoint(&self, endpoint: &str, retry_after: Duration) {
        let path = endpoint_path(endpoint);
        let retry_after = retry_after.min(MAX_RETRY_AFTER);
        let now = Instant::now();
        let until = now.checked_add(retry_after).unwrap_or(now);
        self.blocks.write().await.insert(path.to_string(), until);
        metrics::counter!("api_rate_limit_blocks_total").increment(1);
        info!(
            endpoint = path,
            retry_after_secs = retry_after.as_secs(),
            "endpoint rate-limited"
        );
    }

    /// Fail fast if the endpoint is currently blocked.
    pub async fn check_rate_limit(&self, endpoint: &str) -> Result<()> {
        if self.is_exempt(endpoint) {
            return Ok(());
        }
        match self.remaining(endpoint).await {
            Some(retry_after) => {
                let endpoint = endpoint_path(endpoint).to_string();
                debug!(endpoint, "request refused, endpoint still rate-limited");
                self.notify(retry_after);
                Err(Error::RateLimited {
                    endpoint,
                    retry_after,
                })
            }
            None => Ok(()),
        }
    }

    /// React to a 429: install or refresh the block, notify, and hand back
    /// the error for the caller to raise.
    ///
    /// `retry_after` is whatever the response advertised; the configured
    /// default applies when it advertised nothing, and anything longer than
    /// `MAX_RETRY_AFTER` is clamped. Exempt endpoints still notify but are
    /// not blocked.
    pub async fn handle_rate_limit_error(
        &self,
        endpoint: &str,
        retry_after: Option<Duration>,
    ) -> Error {
        let retry_after = retry_after
            .unwrap_or(self.default_retry_after)
            .min(MAX_RETRY_AFTER);
        let path = endpoint_path(endpoint);
        if self.is_exempt(path) {
            warn!(endpoint = path, "public endpoint rate-limited, not blocking client-side");
        } else {
            self.block_endpoint(path, retry_after).await;
        }
        self.notify(retry_after);
        Error::RateLimited {
            endpoint: path.to_string(),
            retry_after,
        }
    }

    /// Remove every expired block. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut blocks = self.blocks.write().await;
        let before = blocks.len();
        blocks.retain(|_, until| now < *until);
        let removed = before - blocks.len();
        if removed > 0 {
            debug!(removed, "swept expired rate-limit blocks");
        }
        removed
    }

    /// Number of tracked blocks, expired or not.
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notify(&self, retry_after: Duration) {
        self.events.notify(Notice::warning(
            "Too many requests",
            format!("Please wait {} before trying again.", human_wait(retry_after)),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Event;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            vec!["/public".into()],
            Duration::from_secs(60),
            EventBus::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn block_expires_and_is_evicted() {
        let limiter = limiter();
        limiter.block_endpoint("/x", Duration::from_secs(30)).await;
        assert!(limiter.is_blocked("/x").await);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(limiter.is_blocked("/x").await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!limiter.is_blocked("/x").await);
        assert!(limiter.is_empty().await, "expired entry must be evicted on lookup");
    }

    #[tokio::test(start_paused = true)]
    async fn check_fails_fast_while_blocked() {
        let limiter = limiter();
        assert!(limiter.check_rate_limit("/lead").await.is_ok());

        limiter.block_endpoint("/lead", Duration::from_secs(10)).await;
        let err = limiter.check_rate_limit("/lead?userId=2").await.unwrap_err();
        assert_eq!(
            err,
            Error::RateLimited {
                endpoint: "/lead".into(),
                retry_after: Duration::from_secs(10),
            }
        );

        // other endpoints are unaffected
        assert!(limiter.check_rate_limit("/forms").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_429_uses_advertised_or_default_wait() {
        let limiter = limiter();

        let err = limiter
            .handle_rate_limit_error("/a", Some(Duration::from_secs(5)))
            .await;
        assert!(matches!(err, Error::RateLimited { retry_after, .. } if retry_after == Duration::from_secs(5)));

        let err = limiter.handle_rate_limit_error("/b", None).await;
        assert!(matches!(err, Error::RateLimited { retry_after, .. } if retry_after == Duration::from_secs(60)));

        assert!(limiter.is_blocked("/a").await);
        assert!(limiter.is_blocked("/b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_wait_is_clamped() {
        let limiter = limiter();
        let err = limiter
            .handle_rate_limit_error("/x", Some(Duration::from_secs(u64::MAX)))
            .await;
        assert!(matches!(err, Error::RateLimited { retry_after, .. } if retry_after == MAX_RETRY_AFTER));
        assert_eq!(limiter.remaining("/x").await, Some(MAX_RETRY_AFTER));

        limiter.block_endpoint("/y", Duration::MAX).await;
        assert!(limiter.is_blocked("/y").await);

        tokio::time::advance(MAX_RETRY_AFTER).await;
        assert!(!limiter.is_blocked("/x").await);
        assert!(!limiter.is_blocked("/y").await);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_429_refreshes_block() {
        let limiter = limiter();
        limiter.block_endpoint("/x", Duration::from_secs(10)).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        limiter
            .handle_rate_limit_error("/x", Some(Duration::from_secs(10)))
            .await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.is_blocked("/x").await);
    }

    #[tokio::test(start_paused = true)]
    async fn public_endpoints_are_never_blocked() {
        let limiter = limiter();
        let mut events = limiter.events.subscribe();

        let err = limiter
            .handle_rate_limit_error("/public/forms/7", Some(Duration::from_secs(30)))
            .await;
        assert!(matches!(err, Error::RateLimited { .. }));
        assert!(!limiter.is_blocked("/public/forms/7").await);
        assert!(limiter.check_rate_limit("/public/forms/7").await.is_ok());

        // still surfaces a notification
        let event = events.recv().await.unwrap();
        assert!(matches!(event, Event::Notice(ref n) if n.message.contains("30 seconds")));
    }

    #[test]
    fn exemption_matches_whole_segments() {
        let limiter = limiter();
        assert!(limiter.is_exempt("/public"));
        assert!(limiter.is_exempt("/public/forms?id=1"));
        assert!(!limiter.is_exempt("/publications"));
        assert!(!limiter.is_exempt("/lead"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_only_expired_blocks() {
        let limiter = limiter();
        limiter.block_endpoint("/short", Duration::from_secs(5)).await;
        limiter.block_endpoint("/long", Duration::from_secs(50)).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.cleanup().await, 1);
        assert_eq!(limiter.len().await, 1);
        assert!(limiter.is_blocked("/long").await);
    }
}
