//! Records exchanged with the store

use conduit_core::{
    ChannelId, CredentialId, EndpointId, Multiplier, SubscriptionId, TokenId, UsageEventId, UserId, UsdMicros,
};
use std::time::Duration;

use jiff::Timestamp;

pub const UPSTREAM_SNAPSHOT_KEY: &str = "upstream_snapshot";
pub const TOKEN_AUTH_KEY: &str = "token_auth";

const MAX_INVALIDATION_KEY_LEN: usize = 64;

/// Trim and bound-check a cache invalidation key
pub fn normalize_invalidation_key(key: &str) -> Result<&str, crate::StoreError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(crate::StoreError::Invalid("cache invalidation key is empty".to_owned()));
    }
    if key.len() > MAX_INVALIDATION_KEY_LEN {
        return Err(crate::StoreError::Invalid(format!(
            "cache invalidation key exceeds {MAX_INVALIDATION_KEY_LEN} bytes"
        )));
    }
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub main_group: String,
    pub enabled: bool,
}

/// Main groups grant their users a list of channel groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainGroup {
    pub name: String,
    pub subgroups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub id: TokenId,
    pub user_id: UserId,
    /// Lowercase hex SHA-256 of the raw token
    pub token_hash: String,
    pub enabled: bool,
    /// Overrides the user's main-group entitlement when non-empty
    pub groups: Vec<String>,
    pub expires_at: Option<Timestamp>,
}

/// An authenticated token with its effective group entitlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAuth {
    pub token_id: TokenId,
    pub user_id: UserId,
    pub groups: Vec<String>,
    /// Exclusive; cached lookups are rejected from this instant on
    pub expires_at: Option<Timestamp>,
}

impl TokenAuth {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Effective groups: the token's override list wins over the main group's
/// subgroups; a user without either lands in the default group
pub fn resolve_groups(token_groups: &[String], main_subgroups: Option<&[String]>) -> Vec<String> {
    let source: &[String] = if token_groups.iter().any(|g| !g.trim().is_empty()) {
        token_groups
    } else {
        match main_subgroups {
            Some(subgroups) if subgroups.iter().any(|g| !g.trim().is_empty()) => subgroups,
            _ => return vec![conduit_core::DEFAULT_GROUP.to_owned()],
        }
    };

    let mut out: Vec<String> = Vec::with_capacity(source.len());
    for group in source {
        let group = group.trim();
        if !group.is_empty() && !out.iter().any(|g| g == group) {
            out.push(group.to_owned());
        }
    }
    out
}

/// Per-million-token prices for one public model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPricing {
    pub model: String,
    pub input_per_million: UsdMicros,
    pub output_per_million: UsdMicros,
    pub cache_input_per_million: UsdMicros,
    pub cache_output_per_million: UsdMicros,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub id: i64,
    pub name: String,
    /// Channel group the plan is sold for
    pub group: String,
    pub price_multiplier: Multiplier,
    /// Rolling-window limits; zero disables a window
    pub limit_5h: UsdMicros,
    pub limit_1d: UsdMicros,
    pub limit_7d: UsdMicros,
    pub limit_30d: UsdMicros,
}

impl SubscriptionPlan {
    /// Enabled rolling windows as `(name, length, limit)`
    pub fn windows(&self) -> impl Iterator<Item = (&'static str, Duration, UsdMicros)> + '_ {
        const HOUR: u64 = 3600;
        [
            ("5h", Duration::from_secs(5 * HOUR), self.limit_5h),
            ("1d", Duration::from_secs(24 * HOUR), self.limit_1d),
            ("7d", Duration::from_secs(7 * 24 * HOUR), self.limit_7d),
            ("30d", Duration::from_secs(30 * 24 * HOUR), self.limit_30d),
        ]
        .into_iter()
        .filter(|(_, _, limit)| limit.is_positive())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: i64,
    pub start_at: Timestamp,
    pub end_at: Timestamp,
}

impl Subscription {
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.start_at <= now && now < self.end_at
    }

    /// Start of a rolling window, never before the subscription began
    pub fn window_start(&self, now: Timestamp, length: Duration) -> Timestamp {
        let since = conduit_core::time::sub(now, length);
        if since > self.start_at { since } else { self.start_at }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum UsageState {
    Reserved,
    Committed,
    Void,
    Expired,
}

/// What pays for a usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Funding {
    /// Recorded, never charged
    Free,
    /// Prepaid balance, debited at reserve time
    Balance,
    /// Subscription window quota
    Subscription(SubscriptionId),
}

impl Funding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Balance => "balance",
            Self::Subscription(_) => "subscription",
        }
    }

    pub(crate) fn from_parts(kind: &str, subscription_id: Option<SubscriptionId>) -> Option<Self> {
        match (kind, subscription_id) {
            ("free", _) => Some(Self::Free),
            ("balance", _) => Some(Self::Balance),
            ("subscription", Some(id)) => Some(Self::Subscription(id)),
            _ => None,
        }
    }

    pub const fn subscription_id(self) -> Option<SubscriptionId> {
        match self {
            Self::Subscription(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: i64,
    pub cached_input: i64,
    pub output: i64,
    pub cached_output: i64,
}

impl TokenCounts {
    pub const fn total(&self) -> i64 {
        self.input.saturating_add(self.output)
    }
}

/// Per-attempt outcome recorded when a usage event is finalized
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageDetails {
    pub channel_id: Option<ChannelId>,
    pub endpoint_id: Option<EndpointId>,
    pub credential_id: Option<CredentialId>,
    pub route_group: Option<String>,
    pub status_code: Option<u16>,
    pub latency_ms: Option<i64>,
    pub error_class: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReserveUsage {
    /// Idempotency key
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub model: Option<String>,
    pub funding: Funding,
    pub reserved_usd: UsdMicros,
    pub reserve_expires_at: Timestamp,
    pub now: Timestamp,
}

#[derive(Debug, Clone)]
pub struct CommitUsage {
    pub id: UsageEventId,
    pub tokens: TokenCounts,
    pub committed_usd: UsdMicros,
    pub details: UsageDetails,
    pub now: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub id: UsageEventId,
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub model: Option<String>,
    pub funding: Funding,
    pub state: UsageState,
    pub tokens: TokenCounts,
    pub reserved_usd: UsdMicros,
    /// Set exactly once, on the transition out of `reserved`
    pub committed_usd: Option<UsdMicros>,
    pub reserve_expires_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub details: UsageDetails,
}

impl UsageEvent {
    pub const fn subscription_id(&self) -> Option<SubscriptionId> {
        self.funding.subscription_id()
    }
}

/// Committed and still-held spend inside one subscription window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub committed: UsdMicros,
    pub reserved: UsdMicros,
}

impl WindowUsage {
    pub fn total(self) -> UsdMicros {
        self.committed + self.reserved
    }
}

/// Daily aggregate of committed usage per user and model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRollup {
    /// UTC midnight of the aggregated day
    pub day: Timestamp,
    pub user_id: UserId,
    pub model: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_input_tokens: i64,
    pub cached_output_tokens: i64,
    pub committed_usd: UsdMicros,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Committed events folded into rollups
    pub rolled_up: u64,
    /// Raw rows removed (committed, void and expired)
    pub deleted: u64,
}

/// UTC midnight of the day containing `ts`
pub fn day_start(ts: Timestamp) -> Timestamp {
    const DAY: i64 = 86_400;
    let secs = ts.as_second().div_euclid(DAY) * DAY;
    Timestamp::from_second(secs).unwrap_or(ts)
}

/// Fail with [`crate::StoreError::QuotaExceeded`] when any plan window cannot
/// absorb `amount` on top of what `used_since` reports for it
pub(crate) fn check_windows(
    active: &ActiveSubscription,
    amount: UsdMicros,
    now: Timestamp,
    mut used_since: impl FnMut(Timestamp) -> crate::Result<UsdMicros>,
) -> crate::Result<()> {
    let subscription_id = active.subscription.id;
    if !active.subscription.is_active(now) {
        return Err(crate::StoreError::Invalid(format!(
            "subscription {subscription_id} is not active"
        )));
    }
    for (window, length, limit) in active.plan.windows() {
        let used = used_since(active.subscription.window_start(now, length))?;
        if used >= limit || used + amount > limit {
            return Err(crate::StoreError::QuotaExceeded {
                subscription_id,
                window,
                used,
                limit,
            });
        }
    }
    Ok(())
}

/// How a commit settles against the balance for pay-as-you-go events
///
/// Under-runs refund the difference; over-runs debit the extra, capped at
/// what the balance still holds, and the cap becomes the effective charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settlement {
    pub effective: UsdMicros,
    /// Positive values credit the balance
    pub balance_delta: UsdMicros,
}

pub(crate) fn settle(reserved: UsdMicros, committed: UsdMicros, balance: UsdMicros) -> Settlement {
    if committed <= reserved {
        return Settlement {
            effective: committed,
            balance_delta: reserved - committed,
        };
    }
    let extra = committed - reserved;
    let debit = if extra < balance.non_negative() { extra } else { balance.non_negative() };
    Settlement {
        effective: reserved + debit,
        balance_delta: UsdMicros::ZERO - debit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn token_override_wins() {
        let resolved = resolve_groups(&groups(&["vip"]), Some(&groups(&["default", "cheap"])));
        assert_eq!(resolved, groups(&["vip"]));
    }

    #[test]
    fn main_group_subgroups_apply_without_override() {
        let resolved = resolve_groups(&[], Some(&groups(&[" cheap ", "default", "cheap"])));
        assert_eq!(resolved, groups(&["cheap", "default"]));
    }

    #[test]
    fn falls_back_to_default_group() {
        assert_eq!(resolve_groups(&groups(&[" "]), None), groups(&["default"]));
    }

    #[test]
    fn invalidation_keys_are_trimmed_and_bounded() {
        assert_eq!(normalize_invalidation_key("  token_auth ").unwrap(), "token_auth");
        assert!(normalize_invalidation_key("   ").is_err());
        assert!(normalize_invalidation_key(&"k".repeat(65)).is_err());
    }

    #[test]
    fn settle_refunds_under_run() {
        let s = settle(UsdMicros::from_micros(1_000), UsdMicros::from_micros(400), UsdMicros::ZERO);
        assert_eq!(s.effective.micros(), 400);
        assert_eq!(s.balance_delta.micros(), 600);
    }

    #[test]
    fn settle_caps_over_run_at_balance() {
        let s = settle(
            UsdMicros::from_micros(1_000),
            UsdMicros::from_micros(5_000),
            UsdMicros::from_micros(2_500),
        );
        assert_eq!(s.effective.micros(), 3_500);
        assert_eq!(s.balance_delta.micros(), -2_500);
    }

    #[test]
    fn zero_limits_disable_windows() {
        let plan = SubscriptionPlan {
            id: 1,
            name: "pro".to_owned(),
            group: "default".to_owned(),
            price_multiplier: Multiplier::ONE,
            limit_5h: UsdMicros::from_micros(1),
            limit_1d: UsdMicros::ZERO,
            limit_7d: UsdMicros::ZERO,
            limit_30d: UsdMicros::from_micros(9),
        };
        let names: Vec<_> = plan.windows().map(|(name, _, _)| name).collect();
        assert_eq!(names, ["5h", "30d"]);
    }

    #[test]
    fn window_start_is_clamped_to_subscription_start() {
        let sub = Subscription {
            id: 1,
            user_id: 1,
            plan_id: 1,
            start_at: Timestamp::from_second(10_000).unwrap(),
            end_at: Timestamp::from_second(1_000_000).unwrap(),
        };
        let now = Timestamp::from_second(20_000).unwrap();
        assert_eq!(sub.window_start(now, Duration::from_secs(3600)).as_second(), 16_400);
        assert_eq!(sub.window_start(now, Duration::from_secs(86_400)).as_second(), 10_000);
        assert!(sub.is_active(now));
    }

    #[test]
    fn day_start_truncates_to_midnight() {
        let ts = Timestamp::from_second(86_400 * 3 + 4_000).unwrap();
        assert_eq!(day_start(ts).as_second(), 86_400 * 3);
    }
}
