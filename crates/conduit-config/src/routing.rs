use std::time::Duration;

use serde::Deserialize;

/// Upstream snapshot cache
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    /// How long a materialized routing graph is served; `0s` disables caching
    #[serde(default = "default_snapshot_ttl", deserialize_with = "crate::duration::deserialize")]
    pub ttl: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl: default_snapshot_ttl(),
        }
    }
}

/// Cross-process cache invalidation poller
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval", deserialize_with = "crate::duration::deserialize")]
    pub poll_interval: Duration,
    /// Fraction of the interval added or removed at random on each tick
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_poll_interval(),
            jitter: default_jitter(),
        }
    }
}

/// Scheduler cooldown and stickiness policy
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Credential cooldown after a retryable failure, doubled on 429
    #[serde(default = "default_cooldown", deserialize_with = "crate::duration::deserialize")]
    pub cooldown: Duration,
    /// How long a session route key stays bound to its credential; `0s` disables binding
    #[serde(default = "default_binding_ttl", deserialize_with = "crate::duration::deserialize")]
    pub binding_ttl: Duration,
    /// How long a user prefers the channel that last served them; `0s` disables affinity
    #[serde(default = "default_affinity_ttl", deserialize_with = "crate::duration::deserialize")]
    pub affinity_ttl: Duration,
    /// How long one request holds the right to retry a channel whose cooldown lapsed
    #[serde(default = "default_trial_claim_ttl", deserialize_with = "crate::duration::deserialize")]
    pub trial_claim_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            binding_ttl: default_binding_ttl(),
            affinity_ttl: default_affinity_ttl(),
            trial_claim_ttl: default_trial_claim_ttl(),
        }
    }
}

const fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(5)
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_jitter() -> f64 {
    0.2
}

const fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

const fn default_binding_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_affinity_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

const fn default_trial_claim_ttl() -> Duration {
    Duration::from_secs(30)
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}
