//! Store error types

use conduit_core::{SubscriptionId, UsageEventId, UsdMicros};
use thiserror::Error;

use crate::UsageState;

/// Errors returned by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced row does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Balance cannot cover a pay-as-you-go reservation
    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: UsdMicros, required: UsdMicros },

    /// A subscription window cannot absorb the reservation
    #[error("subscription {subscription_id} {window} window exhausted: used {used}, limit {limit}")]
    QuotaExceeded {
        subscription_id: SubscriptionId,
        window: &'static str,
        used: UsdMicros,
        limit: UsdMicros,
    },

    /// Usage event already left the `reserved` state
    #[error("usage event {id} is {state}, expected reserved")]
    InvalidState { id: UsageEventId, state: UsageState },

    /// A usage event already exists for this request id
    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),

    /// Rejected input (bad invalidation key, negative amount, ...)
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Backend cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
