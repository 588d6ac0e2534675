//! Depth snapshot fetch
//!
//! One GET per startup or resync; always routed through the rate limiter.

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::feed::rate_limiter::RateLimiter;
use crate::feed::types::DepthSnapshot;
use tracing::debug;

pub struct SnapshotClient {
    client: reqwest::Client,
    base_url: String,
    limit: u32,
    limiter: RateLimiter,
}

impl SnapshotClient {
    pub fn new(cfg: &FeedConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.rest_base_url.clone(),
            limit: cfg.depth_snapshot_limit,
            limiter: RateLimiter::new(cfg.requests_per_minute, cfg.queue_timeout_secs),
        }
    }

    /// GET /api/v3/depth for the configured symbol
    pub async fn fetch_depth_snapshot(&self, symbol: &str) -> Result<DepthSnapshot, FeedError> {
        self.limiter.wait().await?;

        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            self.limit
        );
        debug!(symbol = %symbol, url = %url, "Fetching depth snapshot");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Snapshot(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Snapshot(format!(
                "HTTP {} from depth endpoint",
                response.status()
            )));
        }

        let snapshot: DepthSnapshot = response
            .json()
            .await
            .map_err(|e| FeedError::Snapshot(e.to_string()))?;

        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bid_levels = snapshot.bids.len(),
            ask_levels = snapshot.asks.len(),
            "Fetched depth snapshot"
        );
        Ok(snapshot)
    }
}
