//! Cross-process cache invalidation by version polling
//!
//! Every admin write bumps a persisted version per cache key. Each process
//! polls those versions and purges its own cache when one moves, so a write
//! made anywhere is visible everywhere within one poll interval plus jitter.

use std::collections::HashMap;
use std::time::Duration;

use conduit_config::InvalidationConfig;
use conduit_store::{StoreError, TOKEN_AUTH_KEY, UPSTREAM_SNAPSHOT_KEY};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::Gateway;

const KEYS: [&str; 2] = [UPSTREAM_SNAPSHOT_KEY, TOKEN_AUTH_KEY];

/// Per-process poller over the invalidation versions
#[derive(Debug)]
pub struct InvalidationPoller {
    gateway: Gateway,
    interval: Duration,
    jitter: f64,
    /// Last observed versions; `None` until the first successful poll
    seen: Option<HashMap<String, i64>>,
}

impl InvalidationPoller {
    pub fn new(gateway: Gateway, config: &InvalidationConfig) -> Self {
        Self {
            gateway,
            interval: config.poll_interval,
            jitter: config.jitter.clamp(0.0, 1.0),
            seen: None,
        }
    }

    /// Poll once, purging caches whose version moved
    ///
    /// The first successful poll only records baselines. Returns the keys
    /// that were purged.
    pub async fn tick(&mut self) -> Result<Vec<&'static str>, StoreError> {
        let versions = self.gateway.store().cache_invalidation_versions(&KEYS).await?;

        let Some(seen) = &mut self.seen else {
            tracing::debug!(?versions, "invalidation baselines recorded");
            self.seen = Some(versions);
            return Ok(Vec::new());
        };

        let mut purged = Vec::new();
        for key in KEYS {
            let current = versions.get(key).copied();
            if current == seen.get(key).copied() {
                continue;
            }
            if let Some(version) = current {
                seen.insert(key.to_owned(), version);
                if self.gateway.invalidate_local(key, "poller") {
                    tracing::info!(key, version, "cache invalidated by remote write");
                    purged.push(key);
                }
            } else {
                seen.remove(key);
            }
        }
        Ok(purged)
    }

    /// Poll until `shutdown` fires
    ///
    /// Store failures skip the cycle and keep the previous baselines.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(interval = ?self.interval, jitter = self.jitter, "invalidation poller started");
        loop {
            if let Err(e) = self.tick().await {
                self.gateway.metrics().poller_error();
                tracing::warn!(error = %e, "invalidation poll failed, skipping cycle");
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.next_delay()) => {}
            }
        }
        tracing::info!("invalidation poller stopped");
    }

    /// Interval scaled by a uniform factor in `[1 - jitter, 1 + jitter]`
    fn next_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        self.interval.mul_f64(factor)
    }
}
