//! Consecutive-failure breaker keyed on `METHOD:endpoint`
//!
//! Each failure bumps the key's count, a success resets it to zero, and the
//! periodic sweep wipes every count so no endpoint stays wedged forever.
//! Nothing here retries; repeated failures only accumulate.

use std::collections::HashMap;
use std::time::Duration;

use common::{EventBus, Notice, human_wait};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint_path;
use crate::error::{Error, Result};

pub struct FailureTracker {
    counts: RwLock<HashMap<String, u32>>,
    threshold: u32,
    sweep_interval: Duration,
    last_sweep: RwLock<Instant>,
    events: EventBus,
}

impl FailureTracker {
    pub fn new(threshold: u32, sweep_interval: Duration, events: EventBus) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            threshold,
            sweep_interval,
            last_sweep: RwLock::new(Instant::now()),
            events,
        }
    }

    pub fn key(method: &str, endpoint: &str) -> String {
        format!("{}:{}", method.to_ascii_uppercase(), endpoint_path(endpoint))
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn failures(&self, method: &str, endpoint: &str) -> u32 {
        let key = Self::key(method, endpoint);
        self.counts.read().await.get(&key).copied().unwrap_or(0)
    }

    /// Refuse the call if the key has reached the threshold.
    pub async fn check(&self, method: &str, endpoint: &str) -> Result<()> {
        let key = Self::key(method, endpoint);
        let failures = self.counts.read().await.get(&key).copied().unwrap_or(0);
        if failures < self.threshold {
            return Ok(());
        }

        let retry_after = self.until_next_sweep().await;
        metrics::counter!("api_circuit_open_total").increment(1);
        warn!(key, failures, "request refused, too many consecutive failures");
        self.events.notify(Notice::error(
            "Service temporarily unavailable",
            format!(
                "This request failed {failures} times in a row. Please wait {} before trying again.",
                human_wait(retry_after)
            ),
        ));
        Err(Error::TooManyFailures {
            key,
            failures,
            retry_after,
        })
    }

    /// Count one more failure. Returns the new consecutive count.
    pub async fn record_failure(&self, method: &str, endpoint: &str) -> u32 {
        let key = Self::key(method, endpoint);
        let mut counts = self.counts.write().await;
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        debug!(key, failures = *count, "request failure recorded");
        *count
    }

    /// Reset the key's count to zero.
    pub async fn record_success(&self, method: &str, endpoint: &str) {
        let key = Self::key(method, endpoint);
        if self.counts.write().await.remove(&key).is_some() {
            debug!(key, "failure count reset");
        }
    }

    /// Wipe every count.
    pub async fn sweep(&self) {
        let cleared = {
            let mut counts = self.counts.write().await;
            let n = counts.len();
            counts.clear();
            n
        };
        *self.last_sweep.write().await = Instant::now();
        if cleared > 0 {
            info!(cleared, "failure records swept");
        }
    }

    async fn until_next_sweep(&self) -> Duration {
        let last = *self.last_sweep.read().await;
        self.sweep_interval.saturating_sub(last.elapsed())
    }
}
