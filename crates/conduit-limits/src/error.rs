use conduit_core::{ChannelId, HttpError};
use http::StatusCode;
use thiserror::Error;

/// Admission rejections
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("token has {limit} requests in flight")]
    TokenInflight { limit: i64 },

    #[error("token has {limit} open streams")]
    TokenStreams { limit: i64 },

    /// Upstream-side caps only cause the dispatcher to skip a candidate
    #[error("credential {key} is at its in-flight cap of {limit}")]
    CredentialBusy { key: String, limit: i64 },

    #[error("channel {channel_id} is at its in-flight cap of {limit}")]
    ChannelBusy { channel_id: ChannelId, limit: i64 },
}

impl HttpError for LimitError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::TokenInflight { .. } | Self::TokenStreams { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CredentialBusy { .. } | Self::ChannelBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::TokenInflight { .. } | Self::TokenStreams { .. } => "rate_limit_error",
            Self::CredentialBusy { .. } | Self::ChannelBusy { .. } => "upstream_unavailable",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::TokenInflight { limit } => format!("too many concurrent requests for this token (limit {limit})"),
            Self::TokenStreams { limit } => format!("too many concurrent streams for this token (limit {limit})"),
            Self::CredentialBusy { .. } | Self::ChannelBusy { .. } => "upstream capacity exhausted".to_owned(),
        }
    }
}
