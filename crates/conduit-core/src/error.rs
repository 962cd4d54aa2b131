use http::StatusCode;
use serde::Serialize;

/// Domain errors that surface to API consumers
///
/// Implemented by the gateway, ledger and admission error types so the
/// outer HTTP layer can render them without depending on their internals.
/// Callers rely on the status to tell "pay first" (402) and "no route" (404)
/// apart from transient upstream failure (503).
pub trait HttpError: std::error::Error {
    /// HTTP status code for this error
    fn status_code(&self) -> StatusCode;

    /// Machine-readable error type (e.g. `insufficient_balance`)
    fn error_type(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;

    /// Render the OpenAI-style error envelope
    fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                message: self.client_message(),
                kind: self.error_type().to_owned(),
                code: self.status_code().as_u16(),
            },
        }
    }
}

/// JSON error envelope returned to clients
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Broke;

    impl std::fmt::Display for Broke {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("broke")
        }
    }

    impl std::error::Error for Broke {}

    impl HttpError for Broke {
        fn status_code(&self) -> StatusCode {
            StatusCode::PAYMENT_REQUIRED
        }

        fn error_type(&self) -> &str {
            "insufficient_balance"
        }

        fn client_message(&self) -> String {
            "top up first".to_owned()
        }
    }

    #[test]
    fn body_serializes_openai_shape() {
        let body = serde_json::to_value(Broke.to_body()).unwrap();
        assert_eq!(body["error"]["type"], "insufficient_balance");
        assert_eq!(body["error"]["code"], 402);
        assert_eq!(body["error"]["message"], "top up first");
    }
}
