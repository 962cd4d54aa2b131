use std::fmt::Write as _;
use std::sync::Arc;

use conduit_config::AuthConfig;
use conduit_store::{DynStore, TokenAuth};
use jiff::Timestamp;
use sha2::{Digest, Sha256};

use crate::{AuthError, TokenAuthCache};

/// Resolves raw API tokens to their owner and group entitlement
#[derive(Clone)]
pub struct TokenResolver {
    store: DynStore,
    cache: TokenAuthCache,
}

impl TokenResolver {
    pub fn new(store: DynStore, config: &AuthConfig) -> Self {
        Self {
            store,
            cache: TokenAuthCache::new(config.token_cache_capacity, config.token_cache_ttl),
        }
    }

    pub const fn cache(&self) -> &TokenAuthCache {
        &self.cache
    }

    /// Authenticate a raw token
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingToken`] for an empty token
    /// - [`AuthError::InvalidToken`] for unknown, disabled or expired tokens
    ///   and tokens whose user is disabled
    /// - [`AuthError::Store`] when the lookup fails
    pub async fn resolve(&self, raw_token: &str, now: Timestamp) -> Result<Arc<TokenAuth>, AuthError> {
        let raw_token = raw_token.trim();
        if raw_token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let hash = sha256_hex(raw_token);

        if let Some(cached) = self.cache.get(&hash) {
            if cached.is_expired(now) {
                self.cache.purge_key(&hash);
                return Err(AuthError::InvalidToken);
            }
            return Ok(cached);
        }

        let generation = self.cache.generation();
        let Some(auth) = self.store.token_auth_by_hash(&hash, now).await? else {
            return Err(AuthError::InvalidToken);
        };
        let auth = Arc::new(auth);
        if !self.cache.insert(hash, Arc::clone(&auth), generation) {
            tracing::debug!(token_id = auth.token_id, "token cache purged during lookup, result not cached");
        }
        Ok(auth)
    }
}

impl std::fmt::Debug for TokenResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Compute the SHA-256 hex digest of a string
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_store::{MemoryStore, Store, TokenRecord, User};

    use super::*;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + secs).unwrap()
    }

    async fn store_with_token(raw: &str) -> Arc<MemoryStore> {
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
                id: 10,
                user_id: 1,
                token_hash: sha256_hex(raw),
                enabled: true,
                groups: vec!["vip".to_owned()],
                expires_at: Some(ts(100)),
            })
            .await
            .unwrap();
        store
    }

    fn config() -> AuthConfig {
        AuthConfig {
            token_cache_capacity: 100,
            token_cache_ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer sk-123"), Some("sk-123"));
        assert_eq!(bearer_token("bearer   sk-123 "), Some("sk-123"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[tokio::test]
    async fn resolves_and_caches_until_purged() {
        let store = store_with_token("sk-live").await;
        let resolver = TokenResolver::new(store.clone(), &config());

        let auth = resolver.resolve("sk-live", ts(0)).await.unwrap();
        assert_eq!((auth.token_id, auth.user_id), (10, 1));
        assert_eq!(auth.groups, ["vip"]);

        store.set_token_enabled(10, false).await.unwrap();
        assert!(resolver.resolve("sk-live", ts(0)).await.is_ok());

        resolver.cache().purge_all();
        assert!(matches!(
            resolver.resolve("sk-live", ts(0)).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn rejects_missing_unknown_and_expired_tokens() {
        let store = store_with_token("sk-live").await;
        let resolver = TokenResolver::new(store.clone(), &config());

        assert!(matches!(resolver.resolve("  ", ts(0)).await, Err(AuthError::MissingToken)));
        assert!(matches!(
            resolver.resolve("sk-other", ts(0)).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            resolver.resolve("sk-live", ts(100)).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn store_failures_surface() {
        let store = store_with_token("sk-live").await;
        let resolver = TokenResolver::new(store.clone(), &config());
        store.set_offline(true);
        assert!(matches!(resolver.resolve("sk-live", ts(0)).await, Err(AuthError::Store(_))));
    }

    #[tokio::test]
    async fn cached_lookup_stops_at_expiry() {
        let store = store_with_token("sk-live").await;
        let resolver = TokenResolver::new(store.clone(), &config());

        assert!(resolver.resolve("sk-live", ts(99)).await.is_ok());
        assert!(resolver.cache().get(&sha256_hex("sk-live")).is_some());

        assert!(matches!(
            resolver.resolve("sk-live", ts(100)).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(resolver.cache().get(&sha256_hex("sk-live")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_during_lookup_keeps_stale_answer_out_of_cache() {
        let store = store_with_token("sk-live").await;
        store.set_lookup_latency(Duration::from_millis(50));
        let resolver = TokenResolver::new(store.clone(), &config());

        let lookup = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("sk-live", ts(0)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_token_enabled(10, false).await.unwrap();
        resolver.cache().purge_all();

        assert!(lookup.await.unwrap().is_ok());
        assert!(resolver.cache().get(&sha256_hex("sk-live")).is_none());

        store.set_lookup_latency(Duration::ZERO);
        assert!(matches!(
            resolver.resolve("sk-live", ts(0)).await,
            Err(AuthError::InvalidToken)
        ));
    }
}
