//! Periodic maintenance: reservation expiry, cooldown sweep, retention and
//! the invalidation poller

use std::future::Future;
use std::time::Duration;

use conduit_config::Config;
use jiff::Timestamp;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{Gateway, InvalidationPoller};

/// Handles to the spawned maintenance loops
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Spawn every enabled job; all of them stop when `shutdown` fires
    pub fn spawn(gateway: &Gateway, config: &Config, shutdown: &CancellationToken) -> Self {
        let mut handles = Vec::with_capacity(4);
        let tasks = &config.tasks;

        let sweep_timeout = tasks.usage_sweep_timeout;
        handles.push((
            "usage_sweep",
            spawn_every("usage_sweep", tasks.usage_sweep_interval, shutdown, {
                let gateway = gateway.clone();
                move || expire_reservations(gateway.clone(), sweep_timeout)
            }),
        ));

        handles.push((
            "cooldown_sweep",
            spawn_every("cooldown_sweep", tasks.cooldown_sweep_interval, shutdown, {
                let gateway = gateway.clone();
                move || {
                    let gateway = gateway.clone();
                    async move {
                        gateway.sweep(Timestamp::now());
                    }
                }
            }),
        ));

        if tasks.retention.enabled {
            let horizon = tasks.retention.horizon;
            handles.push((
                "retention",
                spawn_every("retention", tasks.retention.interval, shutdown, {
                    let gateway = gateway.clone();
                    move || apply_retention(gateway.clone(), horizon)
                }),
            ));
        }

        if config.invalidation.enabled {
            let poller = InvalidationPoller::new(gateway.clone(), &config.invalidation);
            handles.push(("invalidation_poller", tokio::spawn(poller.run(shutdown.clone()))));
        }

        Self { handles }
    }

    /// Names of the running jobs
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handles.iter().map(|(name, _)| *name)
    }

    /// Wait for every job to return after shutdown was signalled
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "background task panicked");
            }
        }
    }
}

fn spawn_every<F, Fut>(name: &'static str, period: Duration, shutdown: &CancellationToken, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(task = name, ?period, "background task started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }
        tracing::debug!(task = name, "background task stopped");
    })
}

async fn expire_reservations(gateway: Gateway, timeout: Duration) {
    match tokio::time::timeout(timeout, gateway.expire_reservations(Timestamp::now())).await {
        Ok(Ok(0)) => {}
        Ok(Ok(expired)) => tracing::info!(expired, "overdue reservations expired"),
        Ok(Err(e)) => tracing::warn!(error = %e, "reservation sweep failed"),
        Err(_) => tracing::warn!(?timeout, "reservation sweep timed out"),
    }
}

async fn apply_retention(gateway: Gateway, horizon: Duration) {
    match gateway.apply_retention(horizon, Timestamp::now()).await {
        Ok(report) if report.deleted > 0 => {
            tracing::info!(rolled_up = report.rolled_up, deleted = report.deleted, "usage retention applied");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "usage retention failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conduit_config::{InvalidationConfig, RetentionConfig, TasksConfig};
    use conduit_core::{Candidate, UsdMicros};
    use conduit_routing::Failure;
    use conduit_store::{Funding, MemoryStore, ReserveUsage, Store, UsageState};

    use super::*;
    use crate::testing::NoopExecutor;

    fn config(invalidation: bool, retention: bool) -> Config {
        Config {
            tasks: TasksConfig {
                usage_sweep_interval: Duration::from_secs(1),
                cooldown_sweep_interval: Duration::from_secs(1),
                retention: RetentionConfig {
                    enabled: retention,
                    ..RetentionConfig::default()
                },
                ..TasksConfig::default()
            },
            invalidation: InvalidationConfig {
                enabled: invalidation,
                ..InvalidationConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_jobs_are_not_spawned() {
        let gateway = Gateway::new(Arc::new(MemoryStore::new()), &Config::default(), Arc::new(NoopExecutor));
        let shutdown = CancellationToken::new();

        let tasks = BackgroundTasks::spawn(&gateway, &config(false, false), &shutdown);
        assert_eq!(tasks.names().collect::<Vec<_>>(), ["usage_sweep", "cooldown_sweep"]);

        let tasks_all = BackgroundTasks::spawn(&gateway, &config(true, true), &shutdown);
        assert_eq!(tasks_all.names().count(), 4);

        shutdown.cancel();
        tasks.join().await;
        tasks_all.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn usage_sweep_expires_overdue_reservations() {
        let store = Arc::new(MemoryStore::new());
        store.credit_balance(1, UsdMicros::from_micros(5_000)).await.unwrap();
        let now = Timestamp::now();
        let id = store
            .reserve_usage(ReserveUsage {
                request_id: "stale".to_owned(),
                user_id: 1,
                token_id: 1,
                model: None,
                funding: Funding::Balance,
                reserved_usd: UsdMicros::from_micros(1_000),
                reserve_expires_at: now - jiff::SignedDuration::from_secs(60),
                now: now - jiff::SignedDuration::from_secs(120),
            })
            .await
            .unwrap();

        let gateway = Gateway::new(store.clone(), &Config::default(), Arc::new(NoopExecutor));
        let shutdown = CancellationToken::new();
        let tasks = BackgroundTasks::spawn(&gateway, &config(false, false), &shutdown);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        shutdown.cancel();
        tasks.join().await;

        let event = store.usage_event(id).await.unwrap().unwrap();
        assert_eq!(event.state, UsageState::Expired);
        assert_eq!(store.balance(1).await.unwrap().micros(), 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_sweep_drops_lapsed_entries() {
        let store = crate::testing::seeded_store(&[(1, 0, &[100])], UsdMicros::from_usd(1.0)).await;
        let gateway = Gateway::new(store, &Config::default(), Arc::new(NoopExecutor));
        let auth = gateway.authenticate(crate::testing::RAW_TOKEN, Timestamp::now()).await.unwrap();

        let past = Timestamp::now() - jiff::SignedDuration::from_secs(3_600);
        let mut candidates = gateway
            .select(&auth, "gpt-4o", conduit_routing::Constraints::default(), None, past)
            .await
            .unwrap();
        let snapshot = Arc::clone(candidates.snapshot());
        let candidate: Candidate = candidates.next().unwrap();
        let session = conduit_routing::Session {
            user_id: auth.user_id,
            route_key: Some("conv"),
        };
        let earlier = past - jiff::SignedDuration::from_secs(60);
        gateway.scheduler().report_success(&candidate, Some(session), earlier);
        gateway
            .scheduler()
            .report_failure(&snapshot, &candidate, &Failure::status(500), past);
        assert!(!gateway.scheduler().cooldowns().is_empty());
        assert_eq!(gateway.scheduler().affinity().len(), 2);

        let shutdown = CancellationToken::new();
        let tasks = BackgroundTasks::spawn(&gateway, &config(false, false), &shutdown);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        shutdown.cancel();
        tasks.join().await;

        assert!(gateway.scheduler().cooldowns().is_empty());
        assert!(gateway.scheduler().affinity().is_empty());
    }
}
