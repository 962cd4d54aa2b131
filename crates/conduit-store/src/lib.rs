//! Persistence for routing data, tokens and the usage ledger
//!
//! The [`Store`] trait is the only place the gateway needs transactional
//! atomicity: reserve, commit, void and expire are each one transaction.
//! Two backends ship: [`MemoryStore`] for tests and single-process runs, and
//! [`SqliteStore`] for anything that should survive a restart or be shared
//! between processes on one host.

#![allow(clippy::must_use_candidate)]

mod error;
mod memory;
mod sqlite;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{
    ChannelGroup, ChannelId, ChannelModel, Credential, CredentialId, RoutingGraph, SubscriptionId, TokenId,
    UpstreamChannel, UpstreamEndpoint, UsageEventId, UserId, UsdMicros,
};
use jiff::Timestamp;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    ActiveSubscription, CommitUsage, Funding, MainGroup, ModelPricing, ReserveUsage, RetentionReport, Subscription,
    SubscriptionPlan, TOKEN_AUTH_KEY, TokenAuth, TokenCounts, TokenRecord, UPSTREAM_SNAPSHOT_KEY, UsageDetails,
    UsageEvent, UsageRollup, UsageState, User, WindowUsage, day_start, normalize_invalidation_key, resolve_groups,
};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Shared handle used across the gateway
pub type DynStore = Arc<dyn Store>;

/// Build the backend named by configuration
///
/// # Errors
///
/// Returns an error if the SQLite database cannot be opened or its schema
/// cannot be created
pub async fn open(config: &conduit_config::StoreConfig) -> Result<DynStore> {
    match config {
        conduit_config::StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        conduit_config::StoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path.clone()).await?)),
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // routing

    /// Read every routing row in one consistent view
    async fn routing_graph(&self) -> Result<RoutingGraph>;

    async fn channel_group(&self, name: &str) -> Result<Option<ChannelGroup>>;

    async fn upsert_channel_group(&self, group: ChannelGroup) -> Result<()>;

    async fn upsert_channel(&self, channel: UpstreamChannel) -> Result<()>;

    async fn set_channel_enabled(&self, id: ChannelId, enabled: bool) -> Result<()>;

    async fn upsert_endpoint(&self, endpoint: UpstreamEndpoint) -> Result<()>;

    async fn upsert_credential(&self, credential: Credential) -> Result<()>;

    async fn set_credential_enabled(&self, id: CredentialId, enabled: bool) -> Result<()>;

    /// Persist an account-level cooldown (codex usage caps), `None` clears it
    async fn set_credential_cooldown(&self, id: CredentialId, until: Option<Timestamp>) -> Result<()>;

    async fn upsert_channel_model(&self, model: ChannelModel) -> Result<()>;

    // tokens and users

    /// Look up an enabled, unexpired token belonging to an enabled user
    async fn token_auth_by_hash(&self, token_hash: &str, now: Timestamp) -> Result<Option<TokenAuth>>;

    async fn upsert_user(&self, user: User) -> Result<()>;

    async fn upsert_main_group(&self, group: MainGroup) -> Result<()>;

    async fn upsert_token(&self, token: TokenRecord) -> Result<()>;

    async fn set_token_enabled(&self, id: TokenId, enabled: bool) -> Result<()>;

    // cache invalidation

    /// Current versions for `keys`; keys never bumped are absent
    async fn cache_invalidation_versions(&self, keys: &[&str]) -> Result<HashMap<String, i64>>;

    /// Increment the version for `key`, creating it at 1, and return it
    async fn bump_cache_invalidation_version(&self, key: &str) -> Result<i64>;

    // pricing and balance

    async fn model_pricing(&self, model: &str) -> Result<Option<ModelPricing>>;

    async fn upsert_model_pricing(&self, pricing: ModelPricing) -> Result<()>;

    async fn balance(&self, user_id: UserId) -> Result<UsdMicros>;

    /// Add `amount` (may be negative) to the balance, returning the new value
    async fn credit_balance(&self, user_id: UserId, amount: UsdMicros) -> Result<UsdMicros>;

    // subscriptions

    async fn upsert_subscription_plan(&self, plan: SubscriptionPlan) -> Result<()>;

    async fn upsert_subscription(&self, subscription: Subscription) -> Result<()>;

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<ActiveSubscription>>;

    /// Subscriptions covering `now`, soonest-ending first
    async fn active_subscriptions(&self, user_id: UserId, now: Timestamp) -> Result<Vec<ActiveSubscription>>;

    /// Spend charged to a subscription since `since`, plus holds still live at `now`
    async fn subscription_window_usage(
        &self,
        subscription_id: SubscriptionId,
        since: Timestamp,
        now: Timestamp,
    ) -> Result<WindowUsage>;

    // usage ledger

    /// Insert a `reserved` event and take the hold in one transaction
    ///
    /// Balance funding debits the balance and fails with
    /// [`StoreError::InsufficientBalance`] when it cannot cover the amount.
    /// Subscription funding fails with [`StoreError::QuotaExceeded`] when any
    /// plan window would overflow.
    async fn reserve_usage(&self, reserve: ReserveUsage) -> Result<UsageEventId>;

    /// Move a `reserved` event to `committed`, returning the amount charged
    async fn commit_usage(&self, commit: CommitUsage) -> Result<UsdMicros>;

    /// Move a `reserved` event to `void` and release its hold
    async fn void_usage(&self, id: UsageEventId, details: UsageDetails, now: Timestamp) -> Result<()>;

    /// Expire every reservation whose deadline is before `before`
    async fn expire_reserved_usage(&self, before: Timestamp) -> Result<u64>;

    async fn usage_event(&self, id: UsageEventId) -> Result<Option<UsageEvent>>;

    async fn usage_events_for_user(&self, user_id: UserId) -> Result<Vec<UsageEvent>>;

    // retention

    /// Fold committed events created before `before` into daily rollups and
    /// delete every finalized event older than that
    async fn roll_up_usage(&self, before: Timestamp) -> Result<RetentionReport>;

    async fn usage_rollups(&self, user_id: UserId) -> Result<Vec<UsageRollup>>;
}
