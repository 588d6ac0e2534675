//! Client-side rate limiter for REST requests
//!
//! GCRA via the governor crate. Snapshot fetches (startup and resync) go
//! through here so a resync storm can never exhaust the exchange's request
//! weight budget.

use crate::error::FeedError;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct RateLimiter {
    limiter: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    queue_timeout: Duration,
    queue_timeout_secs: u64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, queue_timeout_secs: u64) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute.max(1)).expect("nonzero after max(1)"),
        );
        Self {
            limiter: GovernorRateLimiter::direct(quota),
            queue_timeout: Duration::from_secs(queue_timeout_secs),
            queue_timeout_secs,
        }
    }

    /// Wait for permission, giving up after the configured queue timeout
    pub async fn wait(&self) -> Result<(), FeedError> {
        match timeout(self.queue_timeout, async {
            loop {
                if self.limiter.check().is_ok() {
                    debug!("Rate limit permission granted");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    timeout_secs = self.queue_timeout_secs,
                    "Rate limit queue timeout exceeded"
                );
                Err(FeedError::RateLimitTimeout(self.queue_timeout_secs))
            }
        }
    }
}
