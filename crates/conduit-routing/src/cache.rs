//! Process-local snapshot cache

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use conduit_store::{DynStore, StoreError};
use jiff::Timestamp;
use mini_moka::sync::Cache;

use crate::Snapshot;

/// TTL-bounded cache holding at most one [`Snapshot`]
///
/// A zero TTL disables caching and every lookup rebuilds from the store.
/// Concurrent misses share one rebuild. An invalidation that lands while a
/// rebuild is reading the store discards that rebuild's result.
pub struct SnapshotCache {
    store: DynStore,
    cache: Option<Cache<(), Arc<Snapshot>>>,
    rebuild: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl SnapshotCache {
    pub fn new(store: DynStore, ttl: Duration) -> Self {
        let cache = (!ttl.is_zero()).then(|| Cache::builder().max_capacity(1).time_to_live(ttl).build());
        Self {
            store,
            cache,
            rebuild: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Return the cached snapshot or rebuild it from the store
    ///
    /// # Errors
    ///
    /// Returns the store error when the routing graph cannot be read
    pub async fn get(&self) -> Result<Arc<Snapshot>, StoreError> {
        let Some(cache) = &self.cache else {
            return self.load().await;
        };
        if let Some(snapshot) = cache.get(&()) {
            return Ok(snapshot);
        }

        let _guard = self.rebuild.lock().await;
        if let Some(snapshot) = cache.get(&()) {
            return Ok(snapshot);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let snapshot = self.load().await?;
        if self.generation.load(Ordering::Acquire) == generation {
            cache.insert((), Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    /// Drop the cached snapshot so the next lookup rebuilds
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        tracing::debug!("upstream snapshot invalidated");
    }

    /// Number of invalidations seen since startup
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn load(&self) -> Result<Arc<Snapshot>, StoreError> {
        let graph = self.store.routing_graph().await?;
        let snapshot = Snapshot::build(graph, Timestamp::now());
        tracing::debug!(channels = snapshot.channel_count(), "upstream snapshot rebuilt");
        Ok(Arc::new(snapshot))
    }
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("enabled", &self.cache.is_some())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{ChannelKind, UpstreamChannel};
    use conduit_store::{MemoryStore, Store};

    use super::*;

    async fn store_with_channel() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_channel(UpstreamChannel::new(1, ChannelKind::OpenaiCompatible, "default"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn cached_snapshot_survives_store_changes_until_invalidated() {
        let store = store_with_channel().await;
        let cache = SnapshotCache::new(store.clone(), Duration::from_secs(60));

        assert_eq!(cache.get().await.unwrap().channel_count(), 1);

        store.set_channel_enabled(1, false).await.unwrap();
        assert_eq!(cache.get().await.unwrap().channel_count(), 1);

        cache.invalidate();
        assert_eq!(cache.get().await.unwrap().channel_count(), 0);
        assert_eq!(cache.generation(), 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_reads_through() {
        let store = store_with_channel().await;
        let cache = SnapshotCache::new(store.clone(), Duration::ZERO);

        assert_eq!(cache.get().await.unwrap().channel_count(), 1);
        store.set_channel_enabled(1, false).await.unwrap();
        assert_eq!(cache.get().await.unwrap().channel_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_surfaces_and_keeps_nothing() {
        let store = store_with_channel().await;
        let cache = SnapshotCache::new(store.clone(), Duration::from_secs(60));

        store.set_offline(true);
        assert!(matches!(cache.get().await, Err(StoreError::Unavailable(_))));

        store.set_offline(false);
        assert_eq!(cache.get().await.unwrap().channel_count(), 1);
    }
}
