use std::time::Duration;

use serde::Deserialize;

/// Token authentication cache
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Maximum cached tokens
    #[serde(default = "default_cache_capacity")]
    pub token_cache_capacity: u64,
    /// Time-to-live for a cached token lookup
    #[serde(default = "default_cache_ttl", deserialize_with = "crate::duration::deserialize")]
    pub token_cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_cache_capacity: default_cache_capacity(),
            token_cache_ttl: default_cache_ttl(),
        }
    }
}

const fn default_cache_capacity() -> u64 {
    50_000
}

const fn default_cache_ttl() -> Duration {
    Duration::from_secs(2)
}
