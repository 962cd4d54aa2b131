//! Mock OpenAI-compatible upstream for integration tests
//!
//! Fails a configurable number of requests with a fixed status, then answers
//! chat completions with a canned usage block.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use tokio_util::sync::CancellationToken;

pub struct MockUpstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    request_count: AtomicU32,
    /// Requests still to fail before succeeding
    fail_count: AtomicU32,
    fail_status: StatusCode,
    prompt_tokens: u64,
    last_authorization: Mutex<Option<String>>,
    last_model: Mutex<Option<String>>,
}

impl MockUpstream {
    /// Always succeed, reporting 1000 prompt tokens
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_inner(0, StatusCode::INTERNAL_SERVER_ERROR, 1_000).await
    }

    /// Fail the first `n` requests with `status`
    pub async fn start_failing(n: u32, status: u16) -> anyhow::Result<Self> {
        Self::start_inner(n, StatusCode::from_u16(status)?, 1_000).await
    }

    /// Always succeed, reporting `prompt_tokens` input tokens
    pub async fn start_with_usage(prompt_tokens: u64) -> anyhow::Result<Self> {
        Self::start_inner(0, StatusCode::INTERNAL_SERVER_ERROR, prompt_tokens).await
    }

    async fn start_inner(fail_count: u32, fail_status: StatusCode, prompt_tokens: u64) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            request_count: AtomicU32::new(0),
            fail_count: AtomicU32::new(fail_count),
            fail_status,
            prompt_tokens,
            last_authorization: Mutex::new(None),
            last_model: Mutex::new(None),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(handle_chat_completions))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Base URL including `/v1`, as an operator would configure it
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Relaxed)
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().unwrap().clone()
    }

    /// `model` field of the last request body
    pub fn last_model(&self) -> Option<String> {
        self.state.last_model.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    *state.last_authorization.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let model = body["model"].as_str().unwrap_or_default().to_owned();
    *state.last_model.lock().unwrap() = Some(model.clone());

    let failing = state
        .fail_count
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        let error = serde_json::json!({
            "error": {"message": "mock upstream failure", "type": "server_error"}
        });
        return (state.fail_status, Json(error)).into_response();
    }

    Json(serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from mock upstream"},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": state.prompt_tokens,
            "completion_tokens": 1,
            "total_tokens": state.prompt_tokens + 1
        }
    }))
    .into_response()
}
