//! Periodic guard cleanup
//!
//! One background task drives both guards: expired rate-limit blocks are
//! dropped and every consecutive-failure count is wiped. The task runs
//! independently of the request path and lives until its handle is aborted.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::breaker::FailureTracker;
use crate::rate_limit::RateLimiter;

/// Spawn the sweeper. Runs every `interval`, starting one interval from now.
pub fn spawn_sweep_task(
    limiter: Arc<RateLimiter>,
    tracker: Arc<FailureTracker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, nothing has failed yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&limiter, &tracker).await;
        }
    })
}

async fn sweep_cycle(limiter: &RateLimiter, tracker: &FailureTracker) {
    let expired = limiter.cleanup().await;
    tracker.sweep().await;
    debug!(expired_blocks = expired, "guard sweep complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EventBus;

    #[tokio::test(start_paused = true)]
    async fn sweeper_clears_failures_and_expired_blocks() {
        let events = EventBus::new();
        let limiter = Arc::new(RateLimiter::new(
            vec![],
            Duration::from_secs(60),
            events.clone(),
        ));
        let tracker = Arc::new(FailureTracker::new(3, Duration::from_secs(60), events));

        limiter.block_endpoint("/x", Duration::from_secs(10)).await;
        for _ in 0..3 {
            tracker.record_failure("GET", "/lead").await;
        }

        let handle = spawn_sweep_task(limiter.clone(), tracker.clone(), Duration::from_secs(60));

        // first tick is skipped
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(tracker.failures("GET", "/lead").await, 3);
        assert_eq!(limiter.len().await, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(tracker.failures("GET", "/lead").await, 0);
        assert!(limiter.is_empty().await);

        handle.abort();
    }
}
