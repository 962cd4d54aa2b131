use serde::Deserialize;

/// Admission control caps
///
/// Zero or negative disables a cap.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_max_inflight_per_token")]
    pub max_inflight_per_token: i64,
    #[serde(default = "default_max_sse_per_token")]
    pub max_sse_per_token: i64,
    #[serde(default = "default_max_inflight_per_credential")]
    pub max_inflight_per_credential: i64,
    #[serde(default)]
    pub max_inflight_per_channel: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_token: default_max_inflight_per_token(),
            max_sse_per_token: default_max_sse_per_token(),
            max_inflight_per_credential: default_max_inflight_per_credential(),
            max_inflight_per_channel: 0,
        }
    }
}

const fn default_max_inflight_per_token() -> i64 {
    8
}

const fn default_max_sse_per_token() -> i64 {
    4
}

const fn default_max_inflight_per_credential() -> i64 {
    16
}
