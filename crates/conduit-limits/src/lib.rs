//! Admission control: in-flight caps per token, stream, credential and channel
//!
//! Every cap is a counter raised by a non-blocking compare-and-increment and
//! lowered when the returned permit drops. A limit of zero or less disables
//! that cap.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use conduit_config::LimitsConfig;
use conduit_core::{Candidate, ChannelId, TokenId};
use dashmap::DashMap;

pub use error::LimitError;

type Counters<K> = Arc<DashMap<K, Arc<AtomicI64>>>;

/// Shared counters for one process
#[derive(Debug, Clone)]
pub struct Limits {
    token_inflight: Counters<TokenId>,
    token_streams: Counters<TokenId>,
    credentials: Counters<String>,
    channels: Counters<ChannelId>,
    config: LimitsConfig,
}

impl Limits {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            token_inflight: Arc::default(),
            token_streams: Arc::default(),
            credentials: Arc::default(),
            channels: Arc::default(),
            config,
        }
    }

    /// Admit one request for `token_id`, and one stream when `stream` is set
    pub fn acquire_token(&self, token_id: TokenId, stream: bool) -> Result<TokenPermit, LimitError> {
        let limit = self.config.max_inflight_per_token;
        let Some(inflight) = try_acquire(&self.token_inflight, token_id, limit) else {
            tracing::debug!(token_id, limit, "token at in-flight cap");
            return Err(LimitError::TokenInflight { limit });
        };

        let stream = if stream {
            let limit = self.config.max_sse_per_token;
            let Some(permit) = try_acquire(&self.token_streams, token_id, limit) else {
                tracing::debug!(token_id, limit, "token at stream cap");
                return Err(LimitError::TokenStreams { limit });
            };
            Some(permit)
        } else {
            None
        };

        Ok(TokenPermit {
            _inflight: inflight,
            _stream: stream,
        })
    }

    /// Reserve a slot on the candidate's credential and channel
    pub fn acquire_upstream(&self, candidate: &Candidate) -> Result<UpstreamPermit, LimitError> {
        let key = candidate.credential_key();
        let limit = self.config.max_inflight_per_credential;
        let credential = try_acquire(&self.credentials, key.clone(), limit)
            .ok_or(LimitError::CredentialBusy { key, limit })?;

        let limit = self.config.max_inflight_per_channel;
        let channel = try_acquire(&self.channels, candidate.channel_id, limit).ok_or(LimitError::ChannelBusy {
            channel_id: candidate.channel_id,
            limit,
        })?;

        Ok(UpstreamPermit {
            _credential: credential,
            _channel: channel,
        })
    }

    pub fn token_inflight(&self, token_id: TokenId) -> i64 {
        current(&self.token_inflight, &token_id)
    }

    pub fn token_streams(&self, token_id: TokenId) -> i64 {
        current(&self.token_streams, &token_id)
    }

    pub fn credential_inflight(&self, key: &str) -> i64 {
        self.credentials.get(key).map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn channel_inflight(&self, channel_id: ChannelId) -> i64 {
        current(&self.channels, &channel_id)
    }
}

fn current<K: Eq + Hash>(counters: &DashMap<K, Arc<AtomicI64>>, key: &K) -> i64 {
    counters.get(key).map_or(0, |c| c.load(Ordering::Acquire))
}

fn try_acquire<K>(counters: &Counters<K>, key: K, limit: i64) -> Option<Permit<K>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    // The shard lock is held across the increment so a concurrent release
    // cannot remove the entry out from under us.
    let entry = counters.entry(key.clone()).or_default();
    let counter = Arc::clone(entry.value());
    let mut seen = counter.load(Ordering::Acquire);
    loop {
        if limit > 0 && seen >= limit {
            return None;
        }
        match counter.compare_exchange_weak(seen, seen + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => seen = actual,
        }
    }
    drop(entry);
    Some(Permit {
        counters: Arc::clone(counters),
        counter,
        key,
    })
}

/// One held slot; releases on drop
#[derive(Debug)]
struct Permit<K>
where
    K: Eq + Hash,
{
    counters: Counters<K>,
    counter: Arc<AtomicI64>,
    key: K,
}

impl<K> Drop for Permit<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counters
                .remove_if(&self.key, |_, c| c.load(Ordering::Acquire) == 0);
        }
    }
}

/// Held for the whole request
#[derive(Debug)]
pub struct TokenPermit {
    _inflight: Permit<TokenId>,
    _stream: Option<Permit<TokenId>>,
}

/// Held for one upstream attempt
#[derive(Debug)]
pub struct UpstreamPermit {
    _credential: Permit<String>,
    _channel: Permit<ChannelId>,
}
