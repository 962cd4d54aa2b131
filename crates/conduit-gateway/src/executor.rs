//! Upstream HTTP calls, one candidate at a time

use async_trait::async_trait;
use conduit_core::{Candidate, ChannelKind, CredentialSecret};
use conduit_routing::Failure;
use conduit_store::TokenCounts;
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, HeaderMap, HeaderName,
    HeaderValue, PROXY_AUTHORIZATION, RETRY_AFTER, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{Method, StatusCode};
use jiff::Timestamp;
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::usage;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ERROR_BODY_LIMIT: usize = 2048;

/// Request as forwarded to an upstream, before credentials are applied
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Downstream path, e.g. `/v1/chat/completions`
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl UpstreamRequest {
    pub fn post(path: impl Into<String>, body: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            method: Method::POST,
            path: path.into(),
            query: None,
            headers,
            body,
        }
    }
}

/// Successful upstream answer
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Usage reported by the upstream, if any
    pub usage: Option<TokenCounts>,
}

/// Classified upstream failure
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("upstream returned {status}")]
    Status {
        status: u16,
        body: String,
        /// Resume time announced through `Retry-After`
        retry_at: Option<Timestamp>,
    },

    #[error("upstream timed out")]
    Timeout,

    #[error("upstream connect failed: {0}")]
    Connect(String),

    #[error("upstream transport error: {0}")]
    Network(String),

    /// The candidate's API family cannot serve this path
    #[error("{kind} upstream does not serve {path}")]
    Unsupported { kind: ChannelKind, path: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl ExecutorError {
    /// Whether the same request may succeed on another candidate
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Timeout | Self::Connect(_) | Self::Network(_) | Self::Unsupported { .. } => true,
            Self::Cancelled | Self::Malformed(_) => false,
        }
    }

    /// Cooldown input for a retryable failure; `None` means no penalty
    pub const fn failure(&self) -> Option<Failure> {
        match self {
            Self::Status { status, retry_at, .. } if is_retryable_status(*status) => {
                Some(Failure::status(*status).retry_at(*retry_at))
            }
            Self::Timeout | Self::Connect(_) | Self::Network(_) => Some(Failure::network()),
            _ => None,
        }
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short label recorded on the usage event
    pub const fn class(&self) -> &'static str {
        match self {
            Self::Status { status: 429, .. } => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "upstream_5xx",
            Self::Status { .. } => "upstream_4xx",
            Self::Timeout => "timeout",
            Self::Connect(_) => "connect",
            Self::Network(_) => "network",
            Self::Unsupported { .. } => "unsupported",
            Self::Cancelled => "cancelled",
            Self::Malformed(_) => "malformed",
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Rate limits and server faults may clear on another candidate; every other
/// 4xx is the caller's problem and would fail the same way everywhere
const fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Performs the upstream call for one candidate
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        candidate: &Candidate,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, ExecutorError>;
}

/// [`Executor`] over `reqwest`
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, candidate: &Candidate, request: &UpstreamRequest) -> Result<reqwest::RequestBuilder, ExecutorError> {
        let unsupported = || ExecutorError::Unsupported {
            kind: candidate.channel_kind,
            path: request.path.clone(),
        };
        match candidate.channel_kind {
            ChannelKind::OpenaiCompatible => {}
            ChannelKind::Anthropic if request.path != "/v1/messages" => return Err(unsupported()),
            ChannelKind::CodexOauth if request.path != "/v1/responses" => return Err(unsupported()),
            ChannelKind::Anthropic | ChannelKind::CodexOauth => {}
        }
        if candidate.secret.kind() != candidate.channel_kind {
            return Err(unsupported());
        }

        let url = upstream_url(&candidate.base_url, &request.path, request.query.as_deref());
        let mut headers = forwarded_headers(&request.headers);
        apply_credentials(&mut headers, &candidate.secret).map_err(|e| ExecutorError::Malformed(e.to_string()))?;

        Ok(self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(rewrite_model(&request.body, &candidate.upstream_model)))
    }

    async fn send(&self, candidate: &Candidate, builder: reqwest::RequestBuilder) -> Result<UpstreamResponse, ExecutorError> {
        let response = builder.send().await.map_err(|e| {
            tracing::warn!(channel_id = candidate.channel_id, error = %e, "upstream request failed");
            ExecutorError::from_reqwest(&e)
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| ExecutorError::from_reqwest(&e))?;

        if !status.is_success() {
            let retry_at = retry_after(&headers);
            let end = body.len().min(ERROR_BODY_LIMIT);
            tracing::warn!(
                channel_id = candidate.channel_id,
                credential_id = candidate.credential_id,
                status = status.as_u16(),
                "upstream returned error"
            );
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body[..end]).into_owned(),
                retry_at,
            });
        }

        let is_json = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let usage = if is_json {
            usage::parse(candidate.channel_kind, &body).map_err(|e| ExecutorError::Malformed(e.to_string()))?
        } else {
            None
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body: body.to_vec(),
            usage,
        })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        candidate: &Candidate,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, ExecutorError> {
        let builder = self.build(candidate, request)?;
        tokio::select! {
            () = cancel.cancelled() => Err(ExecutorError::Cancelled),
            result = self.send(candidate, builder) => result,
        }
    }
}

/// Join the downstream path onto the endpoint base URL
///
/// A base already ending in `/v1` absorbs the path's own `/v1` prefix.
fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let base_path = base.path().trim_end_matches('/');
    let path = match path.strip_prefix("/v1") {
        Some(rest) if base_path.ends_with("/v1") && rest.starts_with('/') => rest,
        _ => path,
    };
    let mut url = base.clone();
    url.set_path(&format!("{base_path}{path}"));
    url.set_query(query);
    url
}

/// Downstream headers minus hop-by-hop, auth and compression headers
fn forwarded_headers(downstream: &HeaderMap) -> HeaderMap {
    let mut named: Vec<HeaderName> = downstream
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect();
    named.extend([
        HOST,
        CONTENT_LENGTH,
        COOKIE,
        CONNECTION,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
        AUTHORIZATION,
        ACCEPT_ENCODING,
        HeaderName::from_static("x-api-key"),
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
    ]);

    let mut headers = downstream.clone();
    for name in &named {
        headers.remove(name);
    }
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers
}

fn apply_credentials(headers: &mut HeaderMap, secret: &CredentialSecret) -> Result<(), http::header::InvalidHeaderValue> {
    match secret {
        CredentialSecret::OpenaiCompatible { api_key, organization } => {
            headers.insert(AUTHORIZATION, bearer(api_key.expose_secret())?);
            if let Some(org) = organization.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
                headers.insert("openai-organization", HeaderValue::from_str(org)?);
            }
        }
        CredentialSecret::Anthropic { api_key } => {
            let mut key = HeaderValue::from_str(api_key.expose_secret())?;
            key.set_sensitive(true);
            headers.insert("x-api-key", key);
            if !headers.contains_key("anthropic-version") {
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            }
        }
        CredentialSecret::CodexOauth {
            access_token,
            account_id,
        } => {
            headers.insert(AUTHORIZATION, bearer(access_token.expose_secret())?);
            headers.insert("openai-beta", HeaderValue::from_static("responses=experimental"));
            headers.insert("originator", HeaderValue::from_static("codex_cli_rs"));
            if !account_id.trim().is_empty() {
                headers.insert("chatgpt-account-id", HeaderValue::from_str(account_id.trim())?);
            }
            if !headers.contains_key("session_id") {
                headers.insert("session_id", HeaderValue::try_from(uuid::Uuid::new_v4().to_string())?);
            }
        }
    }
    Ok(())
}

fn bearer(token: &str) -> Result<HeaderValue, http::header::InvalidHeaderValue> {
    let mut value = HeaderValue::try_from(format!("Bearer {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Replace the top-level `model` field; non-JSON bodies pass through
fn rewrite_model(body: &[u8], upstream_model: &str) -> Vec<u8> {
    let Ok(serde_json::Value::Object(mut object)) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.to_vec();
    };
    if !object.get("model").is_some_and(serde_json::Value::is_string) {
        return body.to_vec();
    }
    object.insert("model".to_owned(), serde_json::Value::from(upstream_model));
    serde_json::to_vec(&object).unwrap_or_else(|_| body.to_vec())
}

fn retry_after(headers: &HeaderMap) -> Option<Timestamp> {
    let seconds: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(conduit_core::time::add(Timestamp::now(), std::time::Duration::from_secs(seconds)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use conduit_core::Multiplier;
    use secrecy::SecretString;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn candidate(base_url: &str, secret: CredentialSecret) -> Candidate {
        Candidate {
            channel_id: 1,
            channel_kind: secret.kind(),
            group: Arc::from("default"),
            group_multiplier: Multiplier::ONE,
            cooldown: None,
            auto_ban: false,
            endpoint_id: 10,
            base_url: Url::parse(base_url).unwrap(),
            credential_id: 100,
            secret: Arc::new(secret),
            upstream_model: "gpt-4o-2024-08-06".to_owned(),
        }
    }

    fn openai(api_key: &str) -> CredentialSecret {
        CredentialSecret::OpenaiCompatible {
            api_key: SecretString::from(api_key.to_owned()),
            organization: Some("org-1".to_owned()),
        }
    }

    fn chat_request() -> UpstreamRequest {
        let mut request = UpstreamRequest::post(
            "/v1/chat/completions",
            serde_json::to_vec(&serde_json::json!({"model": "gpt-4o", "messages": []})).unwrap(),
        );
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-downstream"));
        request.headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        request
    }

    #[test]
    fn url_join_absorbs_duplicate_v1() {
        let base = Url::parse("https://api.example/v1").unwrap();
        assert_eq!(
            upstream_url(&base, "/v1/chat/completions", None).as_str(),
            "https://api.example/v1/chat/completions"
        );
        let base = Url::parse("https://api.example/openai/").unwrap();
        assert_eq!(
            upstream_url(&base, "/v1/responses", Some("a=1")).as_str(),
            "https://api.example/openai/v1/responses?a=1"
        );
    }

    #[test]
    fn classification() {
        let status = |status| ExecutorError::Status {
            status,
            body: String::new(),
            retry_at: None,
        };
        for retryable in [429, 500, 502, 503, 504] {
            assert!(status(retryable).is_retryable(), "{retryable}");
            assert!(status(retryable).failure().is_some(), "{retryable}");
        }
        for permanent in [400, 401, 403, 404, 405, 408, 409, 413, 422] {
            assert!(!status(permanent).is_retryable(), "{permanent}");
            assert!(status(permanent).failure().is_none(), "{permanent}");
        }
        assert!(!status(429).failure().unwrap().channel_wide);
        assert!(!status(503).failure().unwrap().channel_wide);
        assert!(ExecutorError::Timeout.failure().unwrap().channel_wide);
        assert!(!ExecutorError::Malformed("x".to_owned()).is_retryable());
        assert!(!ExecutorError::Cancelled.is_retryable());
        let unsupported = ExecutorError::Unsupported {
            kind: ChannelKind::Anthropic,
            path: "/v1/chat/completions".to_owned(),
        };
        assert!(unsupported.is_retryable());
        assert!(unsupported.failure().is_none());
    }

    #[test]
    fn model_rewrite_only_touches_json_objects() {
        let rewritten = rewrite_model(br#"{"model":"gpt-4o","n":1}"#, "gpt-4o-mini");
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["n"], 1);
        assert_eq!(rewrite_model(b"not json", "x"), b"not json");
    }

    #[tokio::test]
    async fn openai_request_carries_credential_and_upstream_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-upstream"))
            .and(header("openai-organization", "org-1"))
            .and(header("accept-encoding", "identity"))
            .and(body_json(serde_json::json!({"model": "gpt-4o-2024-08-06", "messages": []})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpExecutor::default();
        let candidate = candidate(&format!("{}/v1", server.uri()), openai("sk-upstream"));
        let response = executor
            .execute(&CancellationToken::new(), &candidate, &chat_request())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        let usage = response.usage.unwrap();
        assert_eq!((usage.input, usage.output), (12, 3));
    }

    #[tokio::test]
    async fn anthropic_and_codex_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"usage": {"input_tokens": 1, "output_tokens": 1}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/backend/v1/responses"))
            .and(header("authorization", "Bearer at-1"))
            .and(header("chatgpt-account-id", "acct-1"))
            .and(header("openai-beta", "responses=experimental"))
            .and(header("originator", "codex_cli_rs"))
            .and(header_exists("session_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "resp_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let executor = HttpExecutor::default();
        let cancel = CancellationToken::new();

        let anthropic = candidate(
            &server.uri(),
            CredentialSecret::Anthropic {
                api_key: SecretString::from("sk-ant".to_owned()),
            },
        );
        let request = UpstreamRequest::post("/v1/messages", b"{}".to_vec());
        executor.execute(&cancel, &anthropic, &request).await.unwrap();

        let codex = candidate(
            &format!("{}/backend", server.uri()),
            CredentialSecret::CodexOauth {
                access_token: SecretString::from("at-1".to_owned()),
                account_id: "acct-1".to_owned(),
            },
        );
        let request = UpstreamRequest::post("/v1/responses", b"{}".to_vec());
        let response = executor.execute(&cancel, &codex, &request).await.unwrap();
        assert!(response.usage.is_none());

        let err = executor.execute(&cancel, &codex, &chat_request()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn error_statuses_carry_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "120")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let executor = HttpExecutor::default();
        let before = Timestamp::now();
        let err = executor
            .execute(&CancellationToken::new(), &candidate(&server.uri(), openai("k")), &chat_request())
            .await
            .unwrap_err();

        let ExecutorError::Status { status, body, retry_at } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(*status, 429);
        assert_eq!(body, "slow down");
        assert!(retry_at.unwrap() >= conduit_core::time::add(before, Duration::from_secs(119)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_json_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{not json", "application/json"))
            .mount(&server)
            .await;

        let err = HttpExecutor::default()
            .execute(&CancellationToken::new(), &candidate(&server.uri(), openai("k")), &chat_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = HttpExecutor::default()
            .execute(&cancel, &candidate(&server.uri(), openai("k")), &chat_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }

    #[tokio::test]
    async fn unreachable_host_is_retryable() {
        let err = HttpExecutor::default()
            .execute(
                &CancellationToken::new(),
                &candidate("http://127.0.0.1:9", openai("k")),
                &chat_request(),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.failure().unwrap().channel_wide);
    }
}
