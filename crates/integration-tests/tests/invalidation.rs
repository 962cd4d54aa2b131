//! Two gateway processes sharing one SQLite database

mod harness;

use std::sync::Arc;
use std::time::Duration;

use conduit_config::{AuthConfig, Config, SnapshotConfig};
use conduit_core::UsdMicros;
use conduit_gateway::{Gateway, GatewayError, HttpExecutor, InvalidationPoller};
use conduit_routing::{Constraints, RoutingError};
use conduit_store::{SqliteStore, Store, TOKEN_AUTH_KEY, UPSTREAM_SNAPSHOT_KEY};
use harness::fixture::{MODEL, RAW_TOKEN, add_channel, seed_tenant};
use jiff::Timestamp;
use tempfile::TempDir;

/// Caches that would outlive the test unless invalidated
fn long_cache_config() -> Config {
    Config {
        snapshot: SnapshotConfig {
            ttl: Duration::from_secs(3_600),
        },
        auth: AuthConfig {
            token_cache_ttl: Duration::from_secs(3_600),
            ..AuthConfig::default()
        },
        ..Config::default()
    }
}

struct Cluster {
    _dir: TempDir,
    a: Gateway,
    b: Gateway,
    b_poller: InvalidationPoller,
}

async fn cluster() -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conduit.db");

    let store_a = SqliteStore::open(&path).await.unwrap();
    seed_tenant(&store_a, UsdMicros::from_usd(1.0)).await.unwrap();
    add_channel(&store_a, 1, 0, "http://127.0.0.1:9/v1").await.unwrap();
    let store_b = SqliteStore::open(&path).await.unwrap();

    let config = long_cache_config();
    let a = Gateway::new(Arc::new(store_a), &config, Arc::new(HttpExecutor::default()));
    let b = Gateway::new(Arc::new(store_b), &config, Arc::new(HttpExecutor::default()));

    let mut b_poller = InvalidationPoller::new(b.clone(), &config.invalidation);
    assert!(b_poller.tick().await.unwrap().is_empty());

    Cluster {
        _dir: dir,
        a,
        b,
        b_poller,
    }
}

async fn routable(gateway: &Gateway) -> Result<(), GatewayError> {
    let auth = gateway.authenticate(RAW_TOKEN, Timestamp::now()).await?;
    gateway
        .select(&auth, MODEL, Constraints::default(), None, Timestamp::now())
        .await
        .map(|_| ())
}

#[tokio::test]
async fn disabled_channel_reaches_other_instance_after_poll() {
    let mut cluster = cluster().await;
    routable(&cluster.a).await.unwrap();
    routable(&cluster.b).await.unwrap();

    cluster.a.disable_channel(1).await.unwrap();

    // writer purges its own snapshot at once
    assert!(matches!(
        routable(&cluster.a).await,
        Err(GatewayError::Routing(RoutingError::ModelUnavailable { .. }))
    ));
    // the other instance still serves its cached snapshot
    routable(&cluster.b).await.unwrap();

    let purged = cluster.b_poller.tick().await.unwrap();
    assert_eq!(purged, [UPSTREAM_SNAPSHOT_KEY]);
    assert!(matches!(
        routable(&cluster.b).await,
        Err(GatewayError::Routing(RoutingError::ModelUnavailable { .. }))
    ));
}

#[tokio::test]
async fn revoked_token_reaches_other_instance_after_poll() {
    let mut cluster = cluster().await;
    routable(&cluster.b).await.unwrap();

    cluster.a.revoke_token(1).await.unwrap();

    assert!(matches!(
        cluster.a.authenticate(RAW_TOKEN, Timestamp::now()).await,
        Err(GatewayError::Auth(_))
    ));
    cluster.b.authenticate(RAW_TOKEN, Timestamp::now()).await.unwrap();

    assert_eq!(cluster.b_poller.tick().await.unwrap(), [TOKEN_AUTH_KEY]);
    assert!(matches!(
        cluster.b.authenticate(RAW_TOKEN, Timestamp::now()).await,
        Err(GatewayError::Auth(_))
    ));
}

#[tokio::test]
async fn unchanged_versions_leave_caches_alone() {
    let mut cluster = cluster().await;
    routable(&cluster.b).await.unwrap();
    let generation = cluster.b.snapshots().generation();

    assert!(cluster.b_poller.tick().await.unwrap().is_empty());
    assert_eq!(cluster.b.snapshots().generation(), generation);

    let versions = cluster
        .b
        .store()
        .cache_invalidation_versions(&[UPSTREAM_SNAPSHOT_KEY, TOKEN_AUTH_KEY])
        .await
        .unwrap();
    assert!(versions.is_empty());
}
