use conduit_auth::AuthError;
use conduit_billing::BillingError;
use conduit_core::HttpError;
use conduit_limits::LimitError;
use conduit_routing::RoutingError;
use conduit_store::StoreError;
use http::StatusCode;
use thiserror::Error;

/// Errors surfaced by [`crate::Gateway`]
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Admission(#[from] LimitError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every candidate failed with a retryable error or was at capacity
    #[error("no upstream available after {attempts} attempts (last status {last_status:?})")]
    UpstreamExhausted { attempts: usize, last_status: Option<u16> },

    /// Upstream rejected the request in a way another upstream would too
    #[error("upstream rejected request with {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Caller went away before an upstream answered
    #[error("request cancelled by caller")]
    Cancelled,
}

impl HttpError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(e) => e.status_code(),
            Self::Routing(e) => e.status_code(),
            Self::Admission(e) => e.status_code(),
            Self::Billing(e) => e.status_code(),
            Self::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            // nginx convention for "client closed request"
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Auth(e) => e.error_type(),
            Self::Routing(e) => e.error_type(),
            Self::Admission(e) => e.error_type(),
            Self::Billing(e) => e.error_type(),
            Self::Store(StoreError::Invalid(_)) => "invalid_request_error",
            Self::Store(_) => "api_error",
            Self::UpstreamExhausted { .. } => "upstream_unavailable",
            Self::Upstream { .. } => "upstream_error",
            Self::Cancelled => "request_cancelled",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Auth(e) => e.client_message(),
            Self::Routing(e) => e.client_message(),
            Self::Admission(e) => e.client_message(),
            Self::Billing(e) => e.client_message(),
            Self::Store(StoreError::Invalid(reason)) => reason.clone(),
            Self::Store(_) => "internal error".to_owned(),
            Self::UpstreamExhausted { .. } => "no upstream available, retry shortly".to_owned(),
            Self::Upstream { message, .. } => message.clone(),
            Self::Cancelled => "request cancelled".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::UsdMicros;

    use super::*;

    #[test]
    fn statuses_separate_error_classes() {
        let config = GatewayError::from(RoutingError::ModelUnavailable { model: "o3".to_owned() });
        assert_eq!(config.status_code(), StatusCode::NOT_FOUND);

        let payment = GatewayError::from(BillingError::InsufficientBalance {
            balance: UsdMicros::ZERO,
            required: UsdMicros::from_micros(1_000),
        });
        assert_eq!(payment.status_code(), StatusCode::PAYMENT_REQUIRED);

        let busy = GatewayError::from(LimitError::TokenInflight { limit: 1 });
        assert_eq!(busy.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let exhausted = GatewayError::UpstreamExhausted {
            attempts: 3,
            last_status: Some(502),
        };
        assert_eq!(exhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(exhausted.to_body().error.kind, "upstream_unavailable");

        let permanent = GatewayError::Upstream {
            status: 400,
            message: "bad request".to_owned(),
        };
        assert_eq!(permanent.status_code(), StatusCode::BAD_REQUEST);

        assert_eq!(GatewayError::Cancelled.status_code().as_u16(), 499);

        let invalid = GatewayError::from(StoreError::Invalid("cache invalidation key is empty".to_owned()));
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.client_message(), "cache invalidation key is empty");
    }
}
