//! Request path: authenticate, select, reserve, dispatch with failover, settle

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_auth::TokenResolver;
use conduit_billing::{BillingError, CommitRequest, Ledger, Reservation, ReserveRequest};
use conduit_config::Config;
use conduit_core::{Candidate, ChannelId, Multiplier, TokenId, UsageEventId, UsdMicros};
use conduit_limits::{LimitError, Limits};
use conduit_routing::{
    AffinityTracker, CandidateIter, Constraints, CooldownTracker, RoutingError, Scheduler, Session, Snapshot, SnapshotCache,
};
use conduit_store::{
    DynStore, RetentionReport, TOKEN_AUTH_KEY, TokenAuth, UPSTREAM_SNAPSHOT_KEY, UsageDetails,
    normalize_invalidation_key,
};
use conduit_telemetry::GatewayMetrics;
use jiff::Timestamp;
use tokio_util::sync::CancellationToken;

use crate::{Executor, ExecutorError, GatewayError, UpstreamRequest, UpstreamResponse};

/// One logical client request
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// Idempotency key for the usage event
    pub request_id: String,
    /// Public model id
    pub model: String,
    pub upstream: UpstreamRequest,
    /// Counts against the per-token stream cap
    pub stream: bool,
    pub input_tokens: Option<i64>,
    pub max_output_tokens: Option<i64>,
    pub constraints: Constraints,
    /// Conversation key; successive requests sharing it stick to one credential
    pub route_key: Option<String>,
}

/// Outcome of a committed request
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub response: UpstreamResponse,
    pub usage_event_id: UsageEventId,
    pub charged: UsdMicros,
    /// Candidate that produced the response
    pub candidate: Candidate,
    /// Upstream calls made, including the successful one
    pub attempts: usize,
}

/// Facade over routing, admission, billing and invalidation
///
/// Cheap to clone; every clone shares the same caches and counters.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    store: DynStore,
    snapshots: SnapshotCache,
    scheduler: Scheduler,
    limits: Limits,
    ledger: Ledger,
    tokens: TokenResolver,
    executor: Arc<dyn Executor>,
    metrics: GatewayMetrics,
}

impl Gateway {
    pub fn new(store: DynStore, config: &Config, executor: Arc<dyn Executor>) -> Self {
        let ledger = Ledger::from_config(Arc::clone(&store), &config.billing);
        Self::with_ledger(store, config, executor, ledger)
    }

    /// Build with an explicitly wired ledger (custom quota provider)
    pub fn with_ledger(store: DynStore, config: &Config, executor: Arc<dyn Executor>, ledger: Ledger) -> Self {
        let scheduling = &config.scheduler;
        let cooldowns =
            Arc::new(CooldownTracker::new(scheduling.cooldown).with_trial_claim_ttl(scheduling.trial_claim_ttl));
        let affinity = Arc::new(AffinityTracker::new(scheduling.binding_ttl, scheduling.affinity_ttl));
        Self {
            inner: Arc::new(Inner {
                snapshots: SnapshotCache::new(Arc::clone(&store), config.snapshot.ttl),
                scheduler: Scheduler::new(cooldowns, affinity),
                limits: Limits::new(config.limits.clone()),
                tokens: TokenResolver::new(Arc::clone(&store), &config.auth),
                ledger,
                executor,
                metrics: GatewayMetrics::global(),
                store,
            }),
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.inner.store
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.inner.snapshots
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn tokens(&self) -> &TokenResolver {
        &self.inner.tokens
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.inner.metrics
    }

    /// Resolve a raw API token
    pub async fn authenticate(&self, raw_token: &str, now: Timestamp) -> Result<Arc<TokenAuth>, GatewayError> {
        Ok(self.inner.tokens.resolve(raw_token, now).await?)
    }

    /// Ordered failover candidates for `model` under the token's groups
    pub async fn select(
        &self,
        auth: &TokenAuth,
        model: &str,
        constraints: Constraints,
        route_key: Option<&str>,
        now: Timestamp,
    ) -> Result<CandidateIter, GatewayError> {
        let snapshot = self.inner.snapshots.get().await.map_err(RoutingError::from)?;
        let session = session(auth, route_key);
        let candidates = self
            .inner
            .scheduler
            .select(snapshot, &auth.groups, model, constraints, Some(session), now)
            .inspect_err(|e| {
                if e.is_configuration() {
                    tracing::info!(token_id = auth.token_id, model, error = %e, "no route");
                }
            })?;
        Ok(candidates)
    }

    pub async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, GatewayError> {
        match self.inner.ledger.reserve(request).await {
            Ok(reservation) => {
                self.inner.metrics.reservation(reservation.funding.as_str());
                Ok(reservation)
            }
            Err(e) => {
                if let Some(kind) = billing_rejection(&e) {
                    self.inner.metrics.admission_rejection(kind);
                }
                Err(e.into())
            }
        }
    }

    pub async fn commit(&self, id: UsageEventId, request: &CommitRequest) -> Result<UsdMicros, GatewayError> {
        let charged = self.inner.ledger.commit(id, request).await?;
        self.inner.metrics.commit(charged.micros());
        Ok(charged)
    }

    pub async fn void(
        &self,
        id: UsageEventId,
        details: UsageDetails,
        reason: &'static str,
        now: Timestamp,
    ) -> Result<(), GatewayError> {
        self.inner.ledger.void(id, details, now).await?;
        self.inner.metrics.void(reason);
        Ok(())
    }

    /// Run one request end to end
    ///
    /// A `reserved` usage event is written before the first upstream call.
    /// Candidates are tried strictly in order, each at most once; retryable
    /// failures cool the candidate and move on, anything else stops. The
    /// event is committed on success and voided on every failure path.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        auth: &TokenAuth,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let inner = &self.inner;
        let _token_permit = inner
            .limits
            .acquire_token(auth.token_id, request.stream)
            .inspect_err(|e| inner.metrics.admission_rejection(limit_rejection(e)))?;

        let now = Timestamp::now();
        let route_key = request.route_key.as_deref();
        let candidates = self.select(auth, &request.model, request.constraints, route_key, now).await?;
        let snapshot = Arc::clone(candidates.snapshot());

        let reservation = self
            .reserve(&ReserveRequest {
                request_id: request.request_id.clone(),
                user_id: auth.user_id,
                token_id: auth.token_id,
                model: Some(request.model.clone()),
                input_tokens: request.input_tokens,
                max_output_tokens: request.max_output_tokens,
                group_multiplier: max_group_multiplier(&snapshot, &auth.groups),
                now,
            })
            .await?;
        let usage_event_id = reservation.usage_event_id;

        let mut attempts = 0_usize;
        let mut last_status = None;
        for candidate in candidates {
            if cancel.is_cancelled() {
                self.void_after_failure(usage_event_id, UsageDetails::default(), "cancelled").await;
                return Err(GatewayError::Cancelled);
            }

            let _upstream_permit = match inner.limits.acquire_upstream(&candidate) {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::debug!(channel_id = candidate.channel_id, error = %e, "candidate at capacity, skipped");
                    continue;
                }
            };

            attempts += 1;
            if attempts > 1 {
                inner.metrics.failover();
            }

            let started = Instant::now();
            let result = inner.executor.execute(cancel, &candidate, &request.upstream).await;
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    let served_at = Timestamp::now();
                    inner
                        .scheduler
                        .report_success(&candidate, Some(session(auth, route_key)), served_at);
                    let commit = CommitRequest {
                        tokens: response.usage.unwrap_or_default(),
                        group_multiplier: candidate.group_multiplier,
                        details: attempt_details(&candidate, Some(response.status.as_u16()), latency, None),
                        now: served_at,
                    };
                    let charged = self.commit(usage_event_id, &commit).await.inspect_err(|e| {
                        tracing::error!(usage_event_id, error = %e, "commit failed after upstream success");
                    })?;
                    return Ok(GatewayResponse {
                        response,
                        usage_event_id,
                        charged,
                        candidate,
                        attempts,
                    });
                }
                Err(ExecutorError::Cancelled) => {
                    let details = attempt_details(&candidate, None, latency, Some("cancelled"));
                    self.void_after_failure(usage_event_id, details, "cancelled").await;
                    return Err(GatewayError::Cancelled);
                }
                Err(e) if e.is_retryable() => {
                    if let Some(failure) = e.failure() {
                        inner
                            .scheduler
                            .report_failure(&snapshot, &candidate, &failure, Timestamp::now());
                    }
                    last_status = e.status().or(last_status);
                    tracing::warn!(
                        request_id = %request.request_id,
                        channel_id = candidate.channel_id,
                        credential_id = candidate.credential_id,
                        attempt = attempts,
                        error = %e,
                        "upstream attempt failed, trying next candidate"
                    );
                }
                Err(e) => {
                    let status = e.status().unwrap_or(502);
                    let details = attempt_details(&candidate, Some(status), latency, Some(e.class()));
                    self.void_after_failure(usage_event_id, details, "upstream_error").await;
                    let message = match &e {
                        ExecutorError::Status { body, .. } if !body.is_empty() => body.clone(),
                        other => other.to_string(),
                    };
                    return Err(GatewayError::Upstream { status, message });
                }
            }
        }

        let details = UsageDetails {
            status_code: last_status,
            error_class: Some("upstream_exhausted".to_owned()),
            ..UsageDetails::default()
        };
        self.void_after_failure(usage_event_id, details, "exhausted").await;
        tracing::warn!(request_id = %request.request_id, attempts, "upstream candidates exhausted");
        Err(GatewayError::UpstreamExhausted { attempts, last_status })
    }

    /// Drop the local snapshot so the next request rebuilds it
    pub fn invalidate_upstream_snapshot(&self) {
        self.invalidate_local(UPSTREAM_SNAPSHOT_KEY, "local");
    }

    pub fn purge_token_auth_cache_all(&self) {
        self.invalidate_local(TOKEN_AUTH_KEY, "local");
    }

    /// Purge the local cache behind `key`; unknown keys are ignored
    pub(crate) fn invalidate_local(&self, key: &str, source: &'static str) -> bool {
        match key {
            UPSTREAM_SNAPSHOT_KEY => self.inner.snapshots.invalidate(),
            TOKEN_AUTH_KEY => self.inner.tokens.cache().purge_all(),
            _ => return false,
        }
        self.inner.metrics.cache_invalidation(key, source);
        true
    }

    /// Invalidate `key` here and bump its version for every other process
    pub async fn invalidate(&self, key: &str) -> Result<i64, GatewayError> {
        let key = normalize_invalidation_key(key)?;
        self.invalidate_local(key, "local");
        let version = self.inner.store.bump_cache_invalidation_version(key).await?;
        tracing::info!(key, version, "cache invalidation published");
        Ok(version)
    }

    /// Call after any write to groups, channels, endpoints, credentials or models
    pub async fn after_routing_write(&self) -> Result<i64, GatewayError> {
        self.invalidate(UPSTREAM_SNAPSHOT_KEY).await
    }

    /// Call after any write to tokens or users
    pub async fn after_token_write(&self) -> Result<i64, GatewayError> {
        self.invalidate(TOKEN_AUTH_KEY).await
    }

    pub async fn disable_channel(&self, id: ChannelId) -> Result<(), GatewayError> {
        self.inner.store.set_channel_enabled(id, false).await?;
        self.after_routing_write().await?;
        tracing::info!(channel_id = id, "channel disabled");
        Ok(())
    }

    pub async fn revoke_token(&self, id: TokenId) -> Result<(), GatewayError> {
        self.inner.store.set_token_enabled(id, false).await?;
        self.after_token_write().await?;
        tracing::info!(token_id = id, "token revoked");
        Ok(())
    }

    pub fn clear_channel_cooldown(&self, id: ChannelId) -> bool {
        self.inner.scheduler.cooldowns().clear_channel(id)
    }

    /// Drop cooldown, binding and affinity entries that lapsed before `now`
    pub fn sweep(&self, now: Timestamp) -> usize {
        let scheduler = &self.inner.scheduler;
        let cleared = scheduler.cooldowns().sweep(now);
        let unbound = scheduler.affinity().sweep(now);
        if cleared + unbound > 0 {
            tracing::debug!(cleared, unbound, "cooldown and affinity entries swept");
        }
        cleared + unbound
    }

    /// Expire reservations whose deadline passed
    pub async fn expire_reservations(&self, now: Timestamp) -> Result<u64, GatewayError> {
        let expired = self.inner.ledger.expire_overdue(now).await?;
        self.inner.metrics.expired(expired);
        Ok(expired)
    }

    pub async fn apply_retention(&self, horizon: Duration, now: Timestamp) -> Result<RetentionReport, GatewayError> {
        Ok(self.inner.ledger.apply_retention(horizon, now).await?)
    }

    async fn void_after_failure(&self, id: UsageEventId, details: UsageDetails, reason: &'static str) {
        if let Err(e) = self.void(id, details, reason, Timestamp::now()).await {
            // left reserved; the expiry sweep releases it
            tracing::error!(usage_event_id = id, error = %e, "failed to void reservation");
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("snapshot_generation", &self.inner.snapshots.generation())
            .field("limits", &self.inner.limits)
            .finish_non_exhaustive()
    }
}

/// Reservations are sized for the most expensive group the token may land in
const fn session<'a>(auth: &TokenAuth, route_key: Option<&'a str>) -> Session<'a> {
    Session {
        user_id: auth.user_id,
        route_key,
    }
}

fn max_group_multiplier(snapshot: &Snapshot, groups: &[String]) -> Multiplier {
    groups
        .iter()
        .filter_map(|g| snapshot.group_multiplier(g))
        .max()
        .unwrap_or(Multiplier::ONE)
}

fn attempt_details(
    candidate: &Candidate,
    status: Option<u16>,
    latency: Duration,
    error_class: Option<&str>,
) -> UsageDetails {
    UsageDetails {
        channel_id: Some(candidate.channel_id),
        endpoint_id: Some(candidate.endpoint_id),
        credential_id: Some(candidate.credential_id),
        route_group: Some(candidate.group.to_string()),
        status_code: status,
        latency_ms: Some(i64::try_from(latency.as_millis()).unwrap_or(i64::MAX)),
        error_class: error_class.map(str::to_owned),
    }
}

const fn limit_rejection(err: &LimitError) -> &'static str {
    match err {
        LimitError::TokenInflight { .. } => "token_inflight",
        LimitError::TokenStreams { .. } => "token_streams",
        LimitError::CredentialBusy { .. } => "credential_busy",
        LimitError::ChannelBusy { .. } => "channel_busy",
    }
}

const fn billing_rejection(err: &BillingError) -> Option<&'static str> {
    match err {
        BillingError::InsufficientBalance { .. } => Some("insufficient_balance"),
        BillingError::QuotaExceeded { .. } => Some("quota_exceeded"),
        BillingError::SubscriptionRequired => Some("subscription_required"),
        BillingError::DuplicateRequest(_) | BillingError::Store(_) => None,
    }
}
