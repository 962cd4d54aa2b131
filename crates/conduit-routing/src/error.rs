//! Routing error types

use conduit_core::HttpError;
use conduit_store::StoreError;
use http::StatusCode;
use thiserror::Error;

/// Errors raised while resolving a request to upstream candidates
#[derive(Debug, Error)]
pub enum RoutingError {
    /// None of the caller's groups exists and is enabled
    #[error("no usable upstream group among {groups:?}")]
    NoUsableGroup { groups: Vec<String> },

    /// No enabled channel in the caller's groups serves the model
    #[error("no channel serves model {model}")]
    ModelUnavailable { model: String },

    /// Channels exist but every one of them is cooling down
    #[error("all channels for model {model} are cooling down")]
    AllCoolingDown { model: String },

    /// Snapshot could not be loaded
    #[error("routing snapshot unavailable: {0}")]
    Store(#[from] StoreError),
}

impl RoutingError {
    /// Configuration failures never succeed on retry
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::NoUsableGroup { .. } | Self::ModelUnavailable { .. })
    }
}

impl HttpError for RoutingError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NoUsableGroup { .. } => StatusCode::FORBIDDEN,
            Self::ModelUnavailable { .. } => StatusCode::NOT_FOUND,
            Self::AllCoolingDown { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::NoUsableGroup { .. } => "permission_error",
            Self::ModelUnavailable { .. } => "model_not_found",
            Self::AllCoolingDown { .. } => "upstream_unavailable",
            Self::Store(_) => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::NoUsableGroup { .. } => "no usable upstream is configured for this token".to_owned(),
            Self::ModelUnavailable { model } => format!("model '{model}' is not available"),
            Self::AllCoolingDown { .. } => "no upstream available, retry shortly".to_owned(),
            Self::Store(_) => "internal error".to_owned(),
        }
    }
}
