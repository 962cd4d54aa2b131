#![allow(clippy::must_use_candidate)]

pub mod auth;
pub mod billing;
pub mod duration;
mod env;
pub mod limits;
mod loader;
pub mod routing;
pub mod server;
pub mod store;
pub mod tasks;
pub mod telemetry;

use serde::Deserialize;

pub use auth::*;
pub use billing::*;
pub use limits::*;
pub use routing::*;
pub use server::*;
pub use store::*;
pub use tasks::*;
pub use telemetry::{LogFormat, TelemetryConfig};

/// Top-level Conduit configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP surface (health and internal endpoints)
    #[serde(default)]
    pub server: ServerConfig,
    /// Persistent store backend
    #[serde(default)]
    pub store: StoreConfig,
    /// Upstream snapshot cache
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Cross-process cache invalidation poller
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    /// Scheduler cooldown and stickiness policy
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Admission control caps
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Usage ledger and quota strategy
    #[serde(default)]
    pub billing: BillingConfig,
    /// Background sweep and retention jobs
    #[serde(default)]
    pub tasks: TasksConfig,
    /// Token authentication cache
    #[serde(default)]
    pub auth: AuthConfig,
    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}
