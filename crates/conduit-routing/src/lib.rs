//! Upstream selection for the Conduit gateway
//!
//! - [`Snapshot`]: indexed routing graph, rebuilt from the store
//! - [`SnapshotCache`]: TTL cache over the snapshot with explicit invalidation
//! - [`CooldownTracker`]: in-memory resume times, failure scores and
//!   recovery claims per channel and credential
//! - [`AffinityTracker`]: route-key bindings and per-user channel affinity
//! - [`Scheduler`]: orders channels and yields a lazy [`CandidateIter`]

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod affinity;
mod cache;
mod cooldown;
mod error;
mod scheduler;
mod snapshot;

pub use affinity::{AffinityTracker, Binding};
pub use cache::SnapshotCache;
pub use cooldown::{CooldownTracker, Failure};
pub use error::RoutingError;
pub use scheduler::{CandidateIter, Constraints, Scheduler, Session};
pub use snapshot::Snapshot;
