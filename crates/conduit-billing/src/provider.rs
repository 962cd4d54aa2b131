//! Quota strategies
//!
//! A provider decides what funds a request (prepaid balance, a subscription
//! window, or nothing at all) and writes the matching reservation. Every
//! reservation is one store transaction, so balance and window checks cannot
//! race with concurrent requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{BillingConfig, BillingMode};
use conduit_core::{Multiplier, TokenId, UsageEventId, UserId, UsdMicros};
use conduit_store::{
    CommitUsage, DynStore, Funding, ReserveUsage, StoreError, TokenCounts, UsageDetails, UsageEvent,
};
use jiff::Timestamp;

use crate::{BillingError, pricing};

const MIN_RESERVE: UsdMicros = UsdMicros::from_micros(1_000);

/// What the caller knows before the upstream call
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Idempotency key for the usage event
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub max_output_tokens: Option<i64>,
    /// Highest multiplier among the caller's entitled groups
    pub group_multiplier: Multiplier,
    pub now: Timestamp,
}

/// A written reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub usage_event_id: UsageEventId,
    pub funding: Funding,
    pub reserved_usd: UsdMicros,
}

/// What the caller learned from the upstream response
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub tokens: TokenCounts,
    /// Multiplier of the group that served the request
    pub group_multiplier: Multiplier,
    pub details: UsageDetails,
    pub now: Timestamp,
}

#[async_trait]
pub trait QuotaProvider: Send + Sync {
    /// Write a `reserved` usage event funded by this strategy
    async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError>;

    /// Settle a reserved event, returning the effective charge
    async fn commit(&self, event: &UsageEvent, request: &CommitRequest) -> Result<UsdMicros, BillingError>;

    /// Release a reserved event without charging
    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError>;
}

/// Base estimate for a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub amount: UsdMicros,
    /// Whether the amount came from model pricing rather than the floor
    pub priced: bool,
}

impl Estimate {
    /// Apply `multiplier` to priced estimates; the floor is never scaled
    pub fn scaled(self, multiplier: Multiplier) -> UsdMicros {
        if self.priced { multiplier.apply(self.amount) } else { self.amount }
    }
}

/// Pricing and reservation plumbing shared by the providers
#[derive(Clone)]
pub struct Pricer {
    store: DynStore,
    floor: UsdMicros,
    reserve_ttl: Duration,
    default_max_output_tokens: i64,
}

impl Pricer {
    pub fn new(store: DynStore, config: &BillingConfig) -> Self {
        let floor = UsdMicros::from_usd(config.default_reserve_usd);
        Self {
            store,
            floor: if floor.is_positive() { floor } else { MIN_RESERVE },
            reserve_ttl: config.reserve_ttl,
            default_max_output_tokens: config.default_max_output_tokens,
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    /// Reservation estimate before multipliers
    ///
    /// Requests without a token budget, without a model, or for a model
    /// without pricing reserve the floor.
    pub async fn estimate(&self, request: &ReserveRequest) -> Result<Estimate, BillingError> {
        let floor = Estimate {
            amount: self.floor,
            priced: false,
        };
        let input = request.input_tokens.filter(|t| *t > 0);
        let output = request.max_output_tokens.filter(|t| *t > 0);
        if input.is_none() && output.is_none() {
            return Ok(floor);
        }
        let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) else {
            return Ok(floor);
        };
        let Some(prices) = self.store.model_pricing(model).await? else {
            tracing::debug!(model, "no pricing for model, reserving floor");
            return Ok(floor);
        };

        let amount = pricing::estimate(
            &prices,
            input.unwrap_or(0),
            output.unwrap_or(self.default_max_output_tokens),
        );
        if amount.is_positive() {
            Ok(Estimate { amount, priced: true })
        } else {
            Ok(floor)
        }
    }

    /// Unmultiplied cost of `tokens`; `None` when the model has no pricing
    pub async fn cost(&self, model: Option<&str>, tokens: &TokenCounts) -> Result<Option<UsdMicros>, BillingError> {
        let Some(model) = model.filter(|m| !m.is_empty()) else {
            return Ok(None);
        };
        let prices = self.store.model_pricing(model).await?;
        Ok(prices.map(|p| pricing::cost(&p, tokens)))
    }

    async fn reserve(
        &self,
        request: &ReserveRequest,
        funding: Funding,
        amount: UsdMicros,
    ) -> Result<Reservation, StoreError> {
        let usage_event_id = self
            .store
            .reserve_usage(ReserveUsage {
                request_id: request.request_id.clone(),
                user_id: request.user_id,
                token_id: request.token_id,
                model: request.model.clone(),
                funding,
                reserved_usd: amount,
                reserve_expires_at: conduit_core::time::add(request.now, self.reserve_ttl),
                now: request.now,
            })
            .await?;
        Ok(Reservation {
            usage_event_id,
            funding,
            reserved_usd: amount,
        })
    }

    /// Price the usage, scale it, and settle; a zero charge falls back to
    /// the reserved amount
    async fn commit_charged(
        &self,
        event: &UsageEvent,
        request: &CommitRequest,
        mode: Multiplier,
    ) -> Result<UsdMicros, BillingError> {
        let base = self
            .cost(event.model.as_deref(), &request.tokens)
            .await?
            .unwrap_or(UsdMicros::ZERO);
        let mut amount = request.group_multiplier.then(mode).apply(base);
        if amount.is_zero() {
            amount = event.reserved_usd;
        }
        self.commit(event, request, amount).await
    }

    async fn commit(
        &self,
        event: &UsageEvent,
        request: &CommitRequest,
        amount: UsdMicros,
    ) -> Result<UsdMicros, BillingError> {
        Ok(self
            .store
            .commit_usage(CommitUsage {
                id: event.id,
                tokens: request.tokens,
                committed_usd: amount,
                details: request.details.clone(),
                now: request.now,
            })
            .await?)
    }

    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        Ok(self.store.void_usage(event.id, details, now).await?)
    }
}

/// Prepaid balance, debited at reserve time
pub struct PaygProvider {
    pricer: Pricer,
    multiplier: Multiplier,
}

impl PaygProvider {
    pub const fn new(pricer: Pricer, multiplier: Multiplier) -> Self {
        Self { pricer, multiplier }
    }
}

#[async_trait]
impl QuotaProvider for PaygProvider {
    async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError> {
        let estimate = self.pricer.estimate(request).await?;
        let amount = estimate.scaled(request.group_multiplier.then(self.multiplier));
        Ok(self.pricer.reserve(request, Funding::Balance, amount).await?)
    }

    async fn commit(&self, event: &UsageEvent, request: &CommitRequest) -> Result<UsdMicros, BillingError> {
        self.pricer.commit_charged(event, request, self.multiplier).await
    }

    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        self.pricer.void(event, details, now).await
    }
}

/// Rolling-window subscription quota
///
/// Subscriptions are tried in the order the store returns them (soonest
/// ending first); the first whose every window can absorb the estimate
/// funds the request.
pub struct SubscriptionProvider {
    pricer: Pricer,
}

impl SubscriptionProvider {
    pub const fn new(pricer: Pricer) -> Self {
        Self { pricer }
    }
}

#[async_trait]
impl QuotaProvider for SubscriptionProvider {
    async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError> {
        let store = self.pricer.store();
        let active = store.active_subscriptions(request.user_id, request.now).await?;
        if active.is_empty() {
            return Err(BillingError::SubscriptionRequired);
        }

        let estimate = self.pricer.estimate(request).await?;
        let mut last_refusal = None;
        for entry in active {
            let amount = estimate.scaled(request.group_multiplier.then(entry.plan.price_multiplier));
            let funding = Funding::Subscription(entry.subscription.id);
            match self.pricer.reserve(request, funding, amount).await {
                Ok(reservation) => return Ok(reservation),
                Err(err @ StoreError::QuotaExceeded { .. }) => {
                    tracing::debug!(subscription_id = entry.subscription.id, error = %err, "subscription window full");
                    last_refusal = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_refusal.map_or(BillingError::SubscriptionRequired, BillingError::from))
    }

    async fn commit(&self, event: &UsageEvent, request: &CommitRequest) -> Result<UsdMicros, BillingError> {
        let mut plan_multiplier = Multiplier::ONE;
        if let Some(id) = event.subscription_id()
            && let Some(active) = self.pricer.store().subscription(id).await?
        {
            plan_multiplier = active.plan.price_multiplier;
        }
        self.pricer.commit_charged(event, request, plan_multiplier).await
    }

    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        self.pricer.void(event, details, now).await
    }
}

/// Subscription first, prepaid balance when no subscription can fund the
/// request and pay-as-you-go is enabled
pub struct HybridProvider {
    subscription: SubscriptionProvider,
    payg: PaygProvider,
    payg_enabled: bool,
}

impl HybridProvider {
    pub const fn new(subscription: SubscriptionProvider, payg: PaygProvider, payg_enabled: bool) -> Self {
        Self {
            subscription,
            payg,
            payg_enabled,
        }
    }
}

#[async_trait]
impl QuotaProvider for HybridProvider {
    async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError> {
        match self.subscription.reserve(request).await {
            Err(BillingError::SubscriptionRequired | BillingError::QuotaExceeded { .. }) if self.payg_enabled => {
                self.payg.reserve(request).await
            }
            other => other,
        }
    }

    async fn commit(&self, event: &UsageEvent, request: &CommitRequest) -> Result<UsdMicros, BillingError> {
        match event.funding {
            Funding::Subscription(_) => self.subscription.commit(event, request).await,
            Funding::Balance | Funding::Free => self.payg.commit(event, request).await,
        }
    }

    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        self.payg.void(event, details, now).await
    }
}

/// Unlimited use that is still recorded
///
/// Reserves nothing and commits the unmultiplied cost, or zero when the
/// model has no pricing.
pub struct FreeProvider {
    pricer: Pricer,
}

impl FreeProvider {
    pub const fn new(pricer: Pricer) -> Self {
        Self { pricer }
    }
}

#[async_trait]
impl QuotaProvider for FreeProvider {
    async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError> {
        Ok(self.pricer.reserve(request, Funding::Free, UsdMicros::ZERO).await?)
    }

    async fn commit(&self, event: &UsageEvent, request: &CommitRequest) -> Result<UsdMicros, BillingError> {
        let amount = self
            .pricer
            .cost(event.model.as_deref(), &request.tokens)
            .await?
            .unwrap_or(UsdMicros::ZERO);
        self.pricer.commit(event, request, amount).await
    }

    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        self.pricer.void(event, details, now).await
    }
}

/// Switches new reservations between the free provider and the configured
/// one; settlement follows whatever funded the event
pub struct FeatureProvider {
    normal: Arc<dyn QuotaProvider>,
    free: FreeProvider,
    free_mode: AtomicBool,
}

impl FeatureProvider {
    pub fn new(normal: Arc<dyn QuotaProvider>, free: FreeProvider, free_mode: bool) -> Self {
        Self {
            normal,
            free,
            free_mode: AtomicBool::new(free_mode),
        }
    }

    /// Build the provider tree described by `config`
    pub fn from_config(store: DynStore, config: &BillingConfig) -> Self {
        let pricer = Pricer::new(store, config);
        let payg_multiplier = Multiplier::from_f64(config.pay_as_you_go_multiplier);
        let normal: Arc<dyn QuotaProvider> = match config.mode {
            BillingMode::PayAsYouGo => Arc::new(PaygProvider::new(pricer.clone(), payg_multiplier)),
            BillingMode::Subscription => Arc::new(SubscriptionProvider::new(pricer.clone())),
            BillingMode::Hybrid => Arc::new(HybridProvider::new(
                SubscriptionProvider::new(pricer.clone()),
                PaygProvider::new(pricer.clone(), payg_multiplier),
                config.pay_as_you_go,
            )),
        };
        Self::new(normal, FreeProvider::new(pricer), config.is_free())
    }

    pub fn is_free(&self) -> bool {
        self.free_mode.load(Ordering::Acquire)
    }

    pub fn set_free(&self, free: bool) {
        self.free_mode.store(free, Ordering::Release);
        tracing::info!(free, "billing mode switched");
    }
}

#[async_trait]
impl QuotaProvider for FeatureProvider {
    async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError> {
        if self.is_free() {
            self.free.reserve(request).await
        } else {
            self.normal.reserve(request).await
        }
    }

    async fn commit(&self, event: &UsageEvent, request: &CommitRequest) -> Result<UsdMicros, BillingError> {
        if event.funding == Funding::Free {
            self.free.commit(event, request).await
        } else {
            self.normal.commit(event, request).await
        }
    }

    async fn void(&self, event: &UsageEvent, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        self.normal.void(event, details, now).await
    }
}
