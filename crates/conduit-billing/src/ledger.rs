//! Reserve, commit, void and expire over one quota provider

use std::sync::Arc;
use std::time::Duration;

use conduit_config::BillingConfig;
use conduit_core::{UsageEventId, UsdMicros};
use conduit_store::{DynStore, RetentionReport, StoreError, UsageDetails, UsageEvent};
use jiff::Timestamp;

use crate::{BillingError, CommitRequest, FeatureProvider, QuotaProvider, Reservation, ReserveRequest};

/// Usage ledger
///
/// Every request gets exactly one usage event: written as `reserved` before
/// the upstream call, then moved to `committed`, `void` or `expired`.
#[derive(Clone)]
pub struct Ledger {
    store: DynStore,
    provider: Arc<dyn QuotaProvider>,
}

impl Ledger {
    pub fn new(store: DynStore, provider: Arc<dyn QuotaProvider>) -> Self {
        Self { store, provider }
    }

    pub fn from_config(store: DynStore, config: &BillingConfig) -> Self {
        let provider = Arc::new(FeatureProvider::from_config(Arc::clone(&store), config));
        Self::new(store, provider)
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, BillingError> {
        let reservation = self.provider.reserve(request).await.inspect_err(|e| {
            if e.is_admission() {
                tracing::info!(user_id = request.user_id, request_id = %request.request_id, error = %e, "reservation refused");
            } else {
                tracing::error!(user_id = request.user_id, request_id = %request.request_id, error = %e, "reservation failed");
            }
        })?;
        tracing::debug!(
            usage_event_id = reservation.usage_event_id,
            reserved_usd = %reservation.reserved_usd,
            funding = ?reservation.funding,
            "usage reserved"
        );
        Ok(reservation)
    }

    /// Settle a reservation against actual usage, returning the charge
    pub async fn commit(&self, id: UsageEventId, request: &CommitRequest) -> Result<UsdMicros, BillingError> {
        let event = self.event(id).await?;
        let charged = self.provider.commit(&event, request).await?;
        tracing::debug!(
            usage_event_id = id,
            reserved_usd = %event.reserved_usd,
            committed_usd = %charged,
            input_tokens = request.tokens.input,
            output_tokens = request.tokens.output,
            "usage committed"
        );
        Ok(charged)
    }

    /// Release a reservation without charging
    pub async fn void(&self, id: UsageEventId, details: UsageDetails, now: Timestamp) -> Result<(), BillingError> {
        let event = self.event(id).await?;
        self.provider.void(&event, details, now).await?;
        tracing::debug!(usage_event_id = id, reserved_usd = %event.reserved_usd, "usage voided");
        Ok(())
    }

    /// Expire reservations whose deadline passed before `now`
    pub async fn expire_overdue(&self, now: Timestamp) -> Result<u64, BillingError> {
        let expired = self.store.expire_reserved_usage(now).await?;
        if expired > 0 {
            tracing::info!(expired, "expired overdue reservations");
        }
        Ok(expired)
    }

    /// Roll committed events older than `horizon` into daily aggregates and
    /// delete finalized raw rows past it
    pub async fn apply_retention(&self, horizon: Duration, now: Timestamp) -> Result<RetentionReport, BillingError> {
        let before = conduit_core::time::sub(now, horizon);
        let report = self.store.roll_up_usage(before).await?;
        if report.deleted > 0 {
            tracing::info!(
                rolled_up = report.rolled_up,
                deleted = report.deleted,
                before = %before,
                "usage retention applied"
            );
        }
        Ok(report)
    }

    async fn event(&self, id: UsageEventId) -> Result<UsageEvent, BillingError> {
        self.store.usage_event(id).await?.ok_or_else(|| {
            BillingError::Store(StoreError::NotFound {
                entity: "usage_event",
                id: id.to_string(),
            })
        })
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use conduit_config::BillingMode;
    use conduit_core::Multiplier;
    use conduit_store::{Funding, MemoryStore, ModelPricing, Store, TokenCounts, UsageState};

    use super::*;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    fn payg() -> BillingConfig {
        BillingConfig {
            mode: BillingMode::PayAsYouGo,
            pay_as_you_go_multiplier: 1.5,
            ..BillingConfig::default()
        }
    }

    fn request(id: &str) -> ReserveRequest {
        ReserveRequest {
            request_id: id.to_owned(),
            user_id: 1,
            token_id: 1,
            model: Some("gpt-4o".to_owned()),
            input_tokens: None,
            max_output_tokens: None,
            group_multiplier: Multiplier::ONE,
            now: ts(0),
        }
    }

    async fn ledger(balance: UsdMicros) -> Ledger {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_model_pricing(ModelPricing {
                model: "gpt-4o".to_owned(),
                input_per_million: UsdMicros::from_usd(10.0),
                output_per_million: UsdMicros::ZERO,
                cache_input_per_million: UsdMicros::ZERO,
                cache_output_per_million: UsdMicros::ZERO,
            })
            .await
            .unwrap();
        store.credit_balance(1, balance).await.unwrap();
        Ledger::from_config(store, &payg())
    }

    #[tokio::test]
    async fn group_and_mode_multipliers_compound() {
        let ledger = ledger(UsdMicros::from_usd(100.0)).await;
        let reservation = ledger.reserve(&request("r1")).await.unwrap();

        let commit = CommitRequest {
            tokens: TokenCounts {
                input: 1_000_000,
                output: 1,
                ..TokenCounts::default()
            },
            group_multiplier: Multiplier::from_f64(2.0),
            details: UsageDetails::default(),
            now: ts(1),
        };
        let charged = ledger.commit(reservation.usage_event_id, &commit).await.unwrap();

        assert_eq!(charged, UsdMicros::from_usd(30.0));
        assert_eq!(ledger.store().balance(1).await.unwrap(), UsdMicros::from_usd(70.0));
    }

    #[tokio::test]
    async fn void_releases_and_blocks_later_commit() {
        let ledger = ledger(UsdMicros::from_usd(1.0)).await;
        let reservation = ledger.reserve(&request("r1")).await.unwrap();
        assert_eq!(reservation.funding, Funding::Balance);

        let details = UsageDetails {
            status_code: Some(502),
            error_class: Some("upstream_exhausted".to_owned()),
            ..UsageDetails::default()
        };
        ledger.void(reservation.usage_event_id, details, ts(1)).await.unwrap();
        assert_eq!(ledger.store().balance(1).await.unwrap(), UsdMicros::from_usd(1.0));

        let err = ledger
            .commit(reservation.usage_event_id, &CommitRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Store(StoreError::InvalidState { .. })));

        let event = ledger.store().usage_event(reservation.usage_event_id).await.unwrap().unwrap();
        assert_eq!(event.state, UsageState::Void);
        assert_eq!(event.details.status_code, Some(502));
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let ledger = ledger(UsdMicros::ZERO).await;
        let err = ledger.void(404, UsageDetails::default(), ts(0)).await.unwrap_err();
        assert!(matches!(err, BillingError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn sweep_expires_overdue_reservations() {
        let ledger = ledger(UsdMicros::from_usd(1.0)).await;
        let reservation = ledger.reserve(&request("r1")).await.unwrap();

        assert_eq!(ledger.expire_overdue(ts(10)).await.unwrap(), 0);
        // default reserve ttl is 150s
        assert_eq!(ledger.expire_overdue(ts(151)).await.unwrap(), 1);
        assert_eq!(ledger.store().balance(1).await.unwrap(), UsdMicros::from_usd(1.0));

        let event = ledger.store().usage_event(reservation.usage_event_id).await.unwrap().unwrap();
        assert_eq!(event.state, UsageState::Expired);
    }

    #[tokio::test]
    async fn retention_rolls_up_committed_usage() {
        let ledger = ledger(UsdMicros::from_usd(100.0)).await;
        let reservation = ledger.reserve(&request("r1")).await.unwrap();
        let commit = CommitRequest {
            tokens: TokenCounts {
                input: 1_000,
                ..TokenCounts::default()
            },
            now: ts(1),
            ..CommitRequest::default()
        };
        ledger.commit(reservation.usage_event_id, &commit).await.unwrap();

        let horizon = Duration::from_secs(3600);
        let report = ledger.apply_retention(horizon, ts(10)).await.unwrap();
        assert_eq!(report, RetentionReport::default());

        let report = ledger.apply_retention(horizon, ts(7200)).await.unwrap();
        assert_eq!(report.rolled_up, 1);
        assert_eq!(report.deleted, 1);
        let rollups = ledger.store().usage_rollups(1).await.unwrap();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].input_tokens, 1_000);
    }
}
