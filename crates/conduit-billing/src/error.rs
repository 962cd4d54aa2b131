use conduit_core::{HttpError, SubscriptionId, UsdMicros};
use conduit_store::StoreError;
use http::StatusCode;
use thiserror::Error;

/// Errors returned by quota providers and the ledger
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("insufficient balance: {balance} available, {required} required")]
    InsufficientBalance { balance: UsdMicros, required: UsdMicros },

    #[error("subscription {subscription_id} {window} window exhausted: {used} of {limit} used")]
    QuotaExceeded {
        subscription_id: SubscriptionId,
        window: &'static str,
        used: UsdMicros,
        limit: UsdMicros,
    },

    /// No active subscription and no fallback allowed
    #[error("an active subscription is required")]
    SubscriptionRequired,

    #[error("request {0} already has a usage event")]
    DuplicateRequest(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientBalance { balance, required } => Self::InsufficientBalance { balance, required },
            StoreError::QuotaExceeded {
                subscription_id,
                window,
                used,
                limit,
            } => Self::QuotaExceeded {
                subscription_id,
                window,
                used,
                limit,
            },
            StoreError::DuplicateRequest(id) => Self::DuplicateRequest(id),
            other => Self::Store(other),
        }
    }
}

impl BillingError {
    /// Whether the caller must pay or wait before retrying
    pub const fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. } | Self::QuotaExceeded { .. } | Self::SubscriptionRequired
        )
    }
}

impl HttpError for BillingError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientBalance { .. } | Self::QuotaExceeded { .. } | Self::SubscriptionRequired => {
                StatusCode::PAYMENT_REQUIRED
            }
            Self::DuplicateRequest(_) => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::SubscriptionRequired => "subscription_required",
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::Store(_) => "api_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::InsufficientBalance { .. } => "insufficient balance, top up to continue".to_owned(),
            Self::QuotaExceeded { window, .. } => format!("subscription quota exhausted for the {window} window"),
            Self::SubscriptionRequired => "an active subscription is required".to_owned(),
            Self::DuplicateRequest(id) => format!("request {id} was already submitted"),
            Self::Store(_) => "internal billing error".to_owned(),
        }
    }
}
