//! In-process store backed by a single mutex-guarded state

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    ChannelGroup, ChannelId, ChannelModel, Credential, CredentialId, EndpointId, RoutingGraph, SubscriptionId,
    TokenId, UpstreamChannel, UpstreamEndpoint, UsageEventId, UserId, UsdMicros,
};
use jiff::Timestamp;

use crate::types::{check_windows, day_start, settle};
use crate::{
    ActiveSubscription, CommitUsage, Funding, MainGroup, ModelPricing, ReserveUsage, Result, RetentionReport, Store,
    StoreError, Subscription, SubscriptionPlan, TokenAuth, TokenCounts, TokenRecord, UsageDetails, UsageEvent,
    UsageRollup, UsageState, User, WindowUsage, normalize_invalidation_key, resolve_groups,
};

/// Store kept entirely in memory
///
/// Every operation takes the one lock, so each call is trivially atomic.
/// [`MemoryStore::set_offline`] makes every call fail with
/// [`StoreError::Unavailable`], which tests use to simulate an outage.
/// [`MemoryStore::set_lookup_latency`] delays token lookups after they have
/// read the state, like a reply still in flight.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    offline: AtomicBool,
    lookup_latency_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<String, ChannelGroup>,
    channels: BTreeMap<ChannelId, UpstreamChannel>,
    endpoints: BTreeMap<EndpointId, UpstreamEndpoint>,
    credentials: BTreeMap<CredentialId, Credential>,
    models: BTreeMap<(ChannelId, String), ChannelModel>,
    users: HashMap<UserId, User>,
    main_groups: HashMap<String, MainGroup>,
    tokens: BTreeMap<TokenId, TokenRecord>,
    versions: HashMap<String, i64>,
    pricing: HashMap<String, ModelPricing>,
    balances: HashMap<UserId, UsdMicros>,
    plans: BTreeMap<i64, SubscriptionPlan>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    events: BTreeMap<UsageEventId, UsageEvent>,
    request_ids: HashMap<String, UsageEventId>,
    next_event_id: UsageEventId,
    rollups: BTreeMap<(i64, UserId, String), UsageRollup>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated unavailability
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every token lookup by `latency` once its answer is read
    pub fn set_lookup_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.lookup_latency_ms.store(ms, Ordering::SeqCst);
    }

    fn lookup_token(&self, token_hash: &str, now: Timestamp) -> Result<Option<TokenAuth>> {
        let state = self.state()?;
        let Some(token) = state.tokens.values().find(|t| t.token_hash == token_hash) else {
            return Ok(None);
        };
        if !token.enabled || token.expires_at.is_some_and(|at| at <= now) {
            return Ok(None);
        }
        let Some(user) = state.users.get(&token.user_id).filter(|u| u.enabled) else {
            return Ok(None);
        };
        let subgroups = state.main_groups.get(&user.main_group).map(|g| g.subgroups.as_slice());
        Ok(Some(TokenAuth {
            token_id: token.id,
            user_id: user.id,
            groups: resolve_groups(&token.groups, subgroups),
            expires_at: token.expires_at,
        }))
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_owned()));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl State {
    fn active_subscription(&self, id: SubscriptionId) -> Option<ActiveSubscription> {
        let subscription = self.subscriptions.get(&id)?;
        let plan = self.plans.get(&subscription.plan_id)?;
        Some(ActiveSubscription {
            subscription: subscription.clone(),
            plan: plan.clone(),
        })
    }

    fn window_usage(&self, subscription_id: SubscriptionId, since: Timestamp, now: Timestamp) -> WindowUsage {
        let mut usage = WindowUsage::default();
        for event in self.events.values() {
            if event.subscription_id() != Some(subscription_id) {
                continue;
            }
            match event.state {
                UsageState::Committed if event.created_at >= since => {
                    usage.committed += event.committed_usd.unwrap_or(UsdMicros::ZERO);
                }
                UsageState::Reserved if event.reserve_expires_at >= now => {
                    usage.reserved += event.reserved_usd;
                }
                _ => {}
            }
        }
        usage
    }

    fn check_windows(&self, subscription_id: SubscriptionId, amount: UsdMicros, now: Timestamp) -> Result<()> {
        let active = self
            .active_subscription(subscription_id)
            .ok_or_else(|| StoreError::not_found("subscription", subscription_id))?;
        check_windows(&active, amount, now, |since| {
            Ok(self.window_usage(subscription_id, since, now).total())
        })
    }

    fn balance_mut(&mut self, user_id: UserId) -> &mut UsdMicros {
        self.balances.entry(user_id).or_insert(UsdMicros::ZERO)
    }

    fn reserved_event_mut(&mut self, id: UsageEventId) -> Result<&mut UsageEvent> {
        let event = self
            .events
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("usage event", id))?;
        if event.state != UsageState::Reserved {
            return Err(StoreError::InvalidState { id, state: event.state });
        }
        Ok(event)
    }

    /// Finalize a reservation without charging it
    fn release(&mut self, id: UsageEventId, state: UsageState, details: Option<UsageDetails>, now: Timestamp) {
        let Some(event) = self.events.get_mut(&id) else {
            return;
        };
        event.state = state;
        event.committed_usd = Some(UsdMicros::ZERO);
        event.updated_at = now;
        if let Some(details) = details {
            event.details = details;
        }
        let (funding, user_id, reserved) = (event.funding, event.user_id, event.reserved_usd);
        if funding == Funding::Balance {
            *self.balance_mut(user_id) += reserved;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn routing_graph(&self) -> Result<RoutingGraph> {
        let state = self.state()?;
        Ok(RoutingGraph {
            groups: state.groups.values().cloned().collect(),
            channels: state.channels.values().cloned().collect(),
            endpoints: state.endpoints.values().cloned().collect(),
            credentials: state.credentials.values().cloned().collect(),
            models: state.models.values().cloned().collect(),
        })
    }

    async fn channel_group(&self, name: &str) -> Result<Option<ChannelGroup>> {
        Ok(self.state()?.groups.get(name).cloned())
    }

    async fn upsert_channel_group(&self, group: ChannelGroup) -> Result<()> {
        self.state()?.groups.insert(group.name.clone(), group);
        Ok(())
    }

    async fn upsert_channel(&self, channel: UpstreamChannel) -> Result<()> {
        self.state()?.channels.insert(channel.id, channel);
        Ok(())
    }

    async fn set_channel_enabled(&self, id: ChannelId, enabled: bool) -> Result<()> {
        let mut state = self.state()?;
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("channel", id))?;
        channel.enabled = enabled;
        Ok(())
    }

    async fn upsert_endpoint(&self, endpoint: UpstreamEndpoint) -> Result<()> {
        let mut state = self.state()?;
        if !state.channels.contains_key(&endpoint.channel_id) {
            return Err(StoreError::not_found("channel", endpoint.channel_id));
        }
        state.endpoints.insert(endpoint.id, endpoint);
        Ok(())
    }

    async fn upsert_credential(&self, credential: Credential) -> Result<()> {
        let mut state = self.state()?;
        if !state.endpoints.contains_key(&credential.endpoint_id) {
            return Err(StoreError::not_found("endpoint", credential.endpoint_id));
        }
        state.credentials.insert(credential.id, credential);
        Ok(())
    }

    async fn set_credential_enabled(&self, id: CredentialId, enabled: bool) -> Result<()> {
        let mut state = self.state()?;
        let credential = state
            .credentials
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("credential", id))?;
        credential.enabled = enabled;
        Ok(())
    }

    async fn set_credential_cooldown(&self, id: CredentialId, until: Option<Timestamp>) -> Result<()> {
        let mut state = self.state()?;
        let credential = state
            .credentials
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("credential", id))?;
        credential.cooldown_until = until;
        Ok(())
    }

    async fn upsert_channel_model(&self, model: ChannelModel) -> Result<()> {
        let mut state = self.state()?;
        if !state.channels.contains_key(&model.channel_id) {
            return Err(StoreError::not_found("channel", model.channel_id));
        }
        state.models.insert((model.channel_id, model.public_model.clone()), model);
        Ok(())
    }

    async fn token_auth_by_hash(&self, token_hash: &str, now: Timestamp) -> Result<Option<TokenAuth>> {
        let auth = self.lookup_token(token_hash, now)?;
        let latency = self.lookup_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(auth)
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        self.state()?.users.insert(user.id, user);
        Ok(())
    }

    async fn upsert_main_group(&self, group: MainGroup) -> Result<()> {
        self.state()?.main_groups.insert(group.name.clone(), group);
        Ok(())
    }

    async fn upsert_token(&self, token: TokenRecord) -> Result<()> {
        let mut state = self.state()?;
        if state
            .tokens
            .values()
            .any(|t| t.token_hash == token.token_hash && t.id != token.id)
        {
            return Err(StoreError::Invalid("token hash already registered".to_owned()));
        }
        state.tokens.insert(token.id, token);
        Ok(())
    }

    async fn set_token_enabled(&self, id: TokenId, enabled: bool) -> Result<()> {
        let mut state = self.state()?;
        let token = state.tokens.get_mut(&id).ok_or_else(|| StoreError::not_found("token", id))?;
        token.enabled = enabled;
        Ok(())
    }

    async fn cache_invalidation_versions(&self, keys: &[&str]) -> Result<HashMap<String, i64>> {
        let state = self.state()?;
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            let key = normalize_invalidation_key(key)?;
            if let Some(version) = state.versions.get(key) {
                out.insert(key.to_owned(), *version);
            }
        }
        Ok(out)
    }

    async fn bump_cache_invalidation_version(&self, key: &str) -> Result<i64> {
        let key = normalize_invalidation_key(key)?;
        let mut state = self.state()?;
        let version = state.versions.entry(key.to_owned()).or_insert(0);
        *version += 1;
        Ok(*version)
    }

    async fn model_pricing(&self, model: &str) -> Result<Option<ModelPricing>> {
        Ok(self.state()?.pricing.get(model).cloned())
    }

    async fn upsert_model_pricing(&self, pricing: ModelPricing) -> Result<()> {
        self.state()?.pricing.insert(pricing.model.clone(), pricing);
        Ok(())
    }

    async fn balance(&self, user_id: UserId) -> Result<UsdMicros> {
        Ok(self.state()?.balances.get(&user_id).copied().unwrap_or(UsdMicros::ZERO))
    }

    async fn credit_balance(&self, user_id: UserId, amount: UsdMicros) -> Result<UsdMicros> {
        let mut state = self.state()?;
        let balance = state.balance_mut(user_id);
        *balance += amount;
        Ok(*balance)
    }

    async fn upsert_subscription_plan(&self, plan: SubscriptionPlan) -> Result<()> {
        self.state()?.plans.insert(plan.id, plan);
        Ok(())
    }

    async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut state = self.state()?;
        if !state.plans.contains_key(&subscription.plan_id) {
            return Err(StoreError::not_found("subscription plan", subscription.plan_id));
        }
        state.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<ActiveSubscription>> {
        Ok(self.state()?.active_subscription(id))
    }

    async fn active_subscriptions(&self, user_id: UserId, now: Timestamp) -> Result<Vec<ActiveSubscription>> {
        let state = self.state()?;
        let mut active: Vec<ActiveSubscription> = state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active(now))
            .filter_map(|s| state.active_subscription(s.id))
            .collect();
        active.sort_by_key(|a| (a.subscription.end_at, a.subscription.id));
        Ok(active)
    }

    async fn subscription_window_usage(
        &self,
        subscription_id: SubscriptionId,
        since: Timestamp,
        now: Timestamp,
    ) -> Result<WindowUsage> {
        Ok(self.state()?.window_usage(subscription_id, since, now))
    }

    async fn reserve_usage(&self, reserve: ReserveUsage) -> Result<UsageEventId> {
        if reserve.reserved_usd.is_negative() {
            return Err(StoreError::Invalid("reserved amount must not be negative".to_owned()));
        }
        let mut state = self.state()?;
        if state.request_ids.contains_key(&reserve.request_id) {
            return Err(StoreError::DuplicateRequest(reserve.request_id));
        }

        match reserve.funding {
            Funding::Free => {}
            Funding::Balance => {
                let balance = state.balance_mut(reserve.user_id);
                if *balance < reserve.reserved_usd {
                    return Err(StoreError::InsufficientBalance {
                        balance: *balance,
                        required: reserve.reserved_usd,
                    });
                }
                *balance -= reserve.reserved_usd;
            }
            Funding::Subscription(id) => state.check_windows(id, reserve.reserved_usd, reserve.now)?,
        }

        state.next_event_id += 1;
        let id = state.next_event_id;
        state.request_ids.insert(reserve.request_id.clone(), id);
        state.events.insert(
            id,
            UsageEvent {
                id,
                request_id: reserve.request_id,
                user_id: reserve.user_id,
                token_id: reserve.token_id,
                model: reserve.model,
                funding: reserve.funding,
                state: UsageState::Reserved,
                tokens: TokenCounts::default(),
                reserved_usd: reserve.reserved_usd,
                committed_usd: None,
                reserve_expires_at: reserve.reserve_expires_at,
                created_at: reserve.now,
                updated_at: reserve.now,
                details: UsageDetails::default(),
            },
        );
        Ok(id)
    }

    async fn commit_usage(&self, commit: CommitUsage) -> Result<UsdMicros> {
        if commit.committed_usd.is_negative() {
            return Err(StoreError::Invalid("committed amount must not be negative".to_owned()));
        }
        let mut state = self.state()?;
        let event = state.reserved_event_mut(commit.id)?;
        let (funding, user_id, reserved) = (event.funding, event.user_id, event.reserved_usd);

        let effective = if funding == Funding::Balance {
            let balance = state.balances.get(&user_id).copied().unwrap_or(UsdMicros::ZERO);
            let settlement = settle(reserved, commit.committed_usd, balance);
            *state.balance_mut(user_id) += settlement.balance_delta;
            settlement.effective
        } else {
            commit.committed_usd
        };

        let event = state.reserved_event_mut(commit.id)?;
        event.state = UsageState::Committed;
        event.committed_usd = Some(effective);
        event.tokens = commit.tokens;
        event.details = commit.details;
        event.updated_at = commit.now;
        Ok(effective)
    }

    async fn void_usage(&self, id: UsageEventId, details: UsageDetails, now: Timestamp) -> Result<()> {
        let mut state = self.state()?;
        state.reserved_event_mut(id)?;
        state.release(id, UsageState::Void, Some(details), now);
        Ok(())
    }

    async fn expire_reserved_usage(&self, before: Timestamp) -> Result<u64> {
        let mut state = self.state()?;
        let overdue: Vec<UsageEventId> = state
            .events
            .values()
            .filter(|e| e.state == UsageState::Reserved && e.reserve_expires_at < before)
            .map(|e| e.id)
            .collect();
        for id in &overdue {
            state.release(*id, UsageState::Expired, None, before);
        }
        Ok(overdue.len() as u64)
    }

    async fn usage_event(&self, id: UsageEventId) -> Result<Option<UsageEvent>> {
        Ok(self.state()?.events.get(&id).cloned())
    }

    async fn usage_events_for_user(&self, user_id: UserId) -> Result<Vec<UsageEvent>> {
        Ok(self
            .state()?
            .events
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn roll_up_usage(&self, before: Timestamp) -> Result<RetentionReport> {
        let mut state = self.state()?;
        let mut report = RetentionReport::default();
        let old: Vec<UsageEvent> = state
            .events
            .values()
            .filter(|e| e.state != UsageState::Reserved && e.created_at < before)
            .cloned()
            .collect();

        for event in old {
            if event.state == UsageState::Committed {
                let day = day_start(event.created_at);
                let model = event.model.clone().unwrap_or_default();
                let rollup = state
                    .rollups
                    .entry((day.as_second(), event.user_id, model.clone()))
                    .or_insert_with(|| UsageRollup {
                        day,
                        user_id: event.user_id,
                        model,
                        requests: 0,
                        input_tokens: 0,
                        output_tokens: 0,
                        cached_input_tokens: 0,
                        cached_output_tokens: 0,
                        committed_usd: UsdMicros::ZERO,
                    });
                rollup.requests += 1;
                rollup.input_tokens += event.tokens.input;
                rollup.output_tokens += event.tokens.output;
                rollup.cached_input_tokens += event.tokens.cached_input;
                rollup.cached_output_tokens += event.tokens.cached_output;
                rollup.committed_usd += event.committed_usd.unwrap_or(UsdMicros::ZERO);
                report.rolled_up += 1;
            }
            state.events.remove(&event.id);
            state.request_ids.remove(&event.request_id);
            report.deleted += 1;
        }
        Ok(report)
    }

    async fn usage_rollups(&self, user_id: UserId) -> Result<Vec<UsageRollup>> {
        Ok(self
            .state()?
            .rollups
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}
