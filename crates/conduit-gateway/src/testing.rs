//! Executors and fixtures for unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conduit_core::{
    Candidate, ChannelGroup, ChannelKind, Credential, CredentialId, CredentialSecret, UpstreamChannel,
    UpstreamEndpoint, UsdMicros,
};
use conduit_store::{MemoryStore, ModelPricing, Store, TokenCounts, TokenRecord, User};
use http::{HeaderMap, StatusCode};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Executor, ExecutorError, UpstreamRequest, UpstreamResponse};

/// Always answers 200 with no usage
#[derive(Debug)]
pub(crate) struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _candidate: &Candidate,
        _request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, ExecutorError> {
        Ok(ok(None))
    }
}

/// Plays back queued outcomes and records which credential each call used
#[derive(Debug, Default)]
pub(crate) struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<UpstreamResponse, ExecutorError>>>,
    calls: Mutex<Vec<CredentialId>>,
}

impl ScriptedExecutor {
    pub(crate) fn new(outcomes: impl IntoIterator<Item = Result<UpstreamResponse, ExecutorError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::default(),
        })
    }

    pub(crate) fn calls(&self) -> Vec<CredentialId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        candidate: &Candidate,
        _request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, ExecutorError> {
        self.calls.lock().unwrap().push(candidate.credential_id);
        self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| Ok(ok(None)))
    }
}

pub(crate) fn ok(usage: Option<TokenCounts>) -> UpstreamResponse {
    UpstreamResponse {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        body: b"{}".to_vec(),
        usage,
    }
}

pub(crate) fn status(status: u16) -> ExecutorError {
    ExecutorError::Status {
        status,
        body: format!("status {status}"),
        retry_at: None,
    }
}

pub(crate) const RAW_TOKEN: &str = "sk-test";

/// One user with balance, one token, `gpt-4o` priced at $10/1M input and
/// the given channels (one endpoint each, credential ids as listed)
pub(crate) async fn seeded_store(channels: &[(i64, i32, &[CredentialId])], balance: UsdMicros) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_user(User {
            id: 1,
            main_group: "default".to_owned(),
            enabled: true,
        })
        .await
        .unwrap();
    store
        .upsert_token(TokenRecord {
            id: 1,
            user_id: 1,
            token_hash: conduit_auth::sha256_hex(RAW_TOKEN),
            enabled: true,
            groups: vec!["default".to_owned()],
            expires_at: None,
        })
        .await
        .unwrap();
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
    store.upsert_channel_group(ChannelGroup::new("default")).await.unwrap();
    store.credit_balance(1, balance).await.unwrap();

    for &(channel_id, priority, credentials) in channels {
        let mut channel = UpstreamChannel::new(channel_id, ChannelKind::OpenaiCompatible, "default");
        channel.priority = priority;
        store.upsert_channel(channel).await.unwrap();
        let endpoint_id = channel_id * 10;
        store
            .upsert_endpoint(UpstreamEndpoint {
                id: endpoint_id,
                channel_id,
                base_url: Url::parse(&format!("https://upstream-{channel_id}.example/v1")).unwrap(),
                priority: 0,
            })
            .await
            .unwrap();
        for &id in credentials {
            store
                .upsert_credential(Credential {
                    id,
                    endpoint_id,
                    enabled: true,
                    secret: CredentialSecret::OpenaiCompatible {
                        api_key: SecretString::from(format!("sk-{id}")),
                        organization: None,
                    },
                    cooldown_until: None,
                })
                .await
                .unwrap();
        }
    }
    store
}
