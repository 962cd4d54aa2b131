use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use conduit_core::TokenId;
use conduit_store::TokenAuth;
use mini_moka::sync::Cache;

/// Bounded, short-lived cache of successful token lookups keyed by token hash
///
/// Only hits are cached, so a token created after a miss is usable at once.
/// Revocations become visible when the entry is purged or its TTL lapses.
/// Every purge moves a generation counter; a lookup that read the store
/// before a purge must not repopulate the cache after it.
#[derive(Clone)]
pub struct TokenAuthCache {
    cache: Cache<String, Arc<TokenAuth>>,
    generation: Arc<AtomicU64>,
}

impl TokenAuthCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(capacity).time_to_live(ttl).build();
        Self {
            cache,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self, token_hash: &str) -> Option<Arc<TokenAuth>> {
        self.cache.get(&token_hash.to_owned())
    }

    /// Purges seen so far; take it before reading the store
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cache a lookup unless a purge happened since `generation` was taken
    ///
    /// Returns whether the entry was stored.
    pub fn insert(&self, token_hash: String, auth: Arc<TokenAuth>, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.cache.insert(token_hash.clone(), auth);
        // A purge landing between the check and the insert may have missed the entry
        if self.generation() != generation {
            self.cache.invalidate(&token_hash);
            return false;
        }
        true
    }

    pub fn purge_key(&self, token_hash: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate(&token_hash.to_owned());
    }

    /// Drop every cached lookup for one token id, returning how many went
    pub fn purge_token_id(&self, token_id: TokenId) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| entry.value().token_id == token_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.cache.invalidate(key);
        }
        keys.len()
    }

    pub fn purge_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
        tracing::debug!("token auth cache purged");
    }
}

impl std::fmt::Debug for TokenAuthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthCache")
            .field("entries", &self.cache.entry_count())
            .field("generation", &self.generation())
            .finish()
    }
}
