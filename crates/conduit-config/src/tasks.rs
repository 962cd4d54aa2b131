use std::time::Duration;

use serde::Deserialize;

/// Background maintenance jobs
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TasksConfig {
    /// How often overdue reservations are expired
    #[serde(default = "default_usage_sweep_interval", deserialize_with = "crate::duration::deserialize")]
    pub usage_sweep_interval: Duration,
    /// Upper bound on one expiry pass
    #[serde(default = "default_usage_sweep_timeout", deserialize_with = "crate::duration::deserialize")]
    pub usage_sweep_timeout: Duration,
    /// How often expired cooldown entries are dropped
    #[serde(default = "default_cooldown_sweep_interval", deserialize_with = "crate::duration::deserialize")]
    pub cooldown_sweep_interval: Duration,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            usage_sweep_interval: default_usage_sweep_interval(),
            usage_sweep_timeout: default_usage_sweep_timeout(),
            cooldown_sweep_interval: default_cooldown_sweep_interval(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Raw usage event retention
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval", deserialize_with = "crate::duration::deserialize")]
    pub interval: Duration,
    /// Raw events older than this are rolled up and deleted
    #[serde(default = "default_retention_horizon", deserialize_with = "crate::duration::deserialize")]
    pub horizon: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_retention_interval(),
            horizon: default_retention_horizon(),
        }
    }
}

const fn default_usage_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_usage_sweep_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_cooldown_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_retention_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_retention_horizon() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}
