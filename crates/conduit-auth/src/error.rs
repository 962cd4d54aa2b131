use conduit_core::HttpError;
use conduit_store::StoreError;
use http::StatusCode;

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No bearer token on the request
    #[error("missing API token")]
    MissingToken,

    /// Unknown, disabled, revoked or expired token
    #[error("invalid API token")]
    InvalidToken,

    /// Token lookup could not be completed
    #[error("token lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl HttpError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::MissingToken | Self::InvalidToken => "authentication_error",
            Self::Store(_) => "api_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::MissingToken => "missing API token".to_owned(),
            Self::InvalidToken => "invalid API token".to_owned(),
            Self::Store(_) => "internal error".to_owned(),
        }
    }
}
