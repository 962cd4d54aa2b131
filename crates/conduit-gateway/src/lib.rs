//! Conduit request core
//!
//! Ties the routing snapshot, admission limits and usage ledger together
//! behind [`Gateway::dispatch`], which walks failover candidates for one
//! request under a single usage reservation. [`BackgroundTasks`] keeps
//! reservations, cooldowns and cross-process caches tidy.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod error;
mod executor;
mod gateway;
mod poller;
mod tasks;
mod usage;

#[cfg(test)]
mod testing;

pub use error::GatewayError;
pub use executor::{Executor, ExecutorError, HttpExecutor, UpstreamRequest, UpstreamResponse};
pub use gateway::{Gateway, GatewayRequest, GatewayResponse};
pub use poller::InvalidationPoller;
pub use tasks::BackgroundTasks;
