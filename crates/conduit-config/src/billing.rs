use std::time::Duration;

use serde::Deserialize;

/// Usage ledger and quota strategy
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingConfig {
    /// Which quota strategy funds requests
    #[serde(default)]
    pub mode: BillingMode,
    /// Single-operator deployment: usage is recorded but never charged
    #[serde(default)]
    pub self_mode: bool,
    /// Record usage without charging, regardless of mode
    #[serde(default)]
    pub disabled: bool,
    /// Allow falling back to the prepaid balance in hybrid mode
    #[serde(default = "default_true")]
    pub pay_as_you_go: bool,
    /// Global multiplier applied to pay-as-you-go charges
    #[serde(default = "default_multiplier")]
    pub pay_as_you_go_multiplier: f64,
    /// Reservation floor when the caller gives no output budget
    #[serde(default = "default_reserve_usd")]
    pub default_reserve_usd: f64,
    /// How long a reservation may stay open before the sweep expires it
    #[serde(default = "default_reserve_ttl", deserialize_with = "crate::duration::deserialize")]
    pub reserve_ttl: Duration,
    /// Output budget assumed for estimates when the request names none
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            mode: BillingMode::default(),
            self_mode: false,
            disabled: false,
            pay_as_you_go: true,
            pay_as_you_go_multiplier: default_multiplier(),
            default_reserve_usd: default_reserve_usd(),
            reserve_ttl: default_reserve_ttl(),
            default_max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl BillingConfig {
    /// Whether requests run through the free provider
    pub const fn is_free(&self) -> bool {
        self.self_mode || self.disabled
    }
}

/// Quota strategy
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Subscription windows first, prepaid balance as fallback
    #[default]
    Hybrid,
    /// Prepaid balance only
    PayAsYouGo,
    /// Subscription windows only
    Subscription,
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}

const fn default_multiplier() -> f64 {
    1.0
}

const fn default_reserve_usd() -> f64 {
    0.001
}

const fn default_reserve_ttl() -> Duration {
    Duration::from_secs(150)
}

const fn default_max_output_tokens() -> i64 {
    1024
}
