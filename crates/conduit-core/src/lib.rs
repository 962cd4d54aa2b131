//! Shared domain types for the Conduit gateway
//!
//! Everything that more than one crate needs to agree on lives here: the
//! routing graph records persisted by the store, the uniform candidate record
//! handed from the scheduler to the executor, fixed-point money, and the
//! `HttpError` trait used to map domain failures onto responses.

#![allow(clippy::must_use_candidate)]

mod candidate;
mod error;
mod money;
mod routing;
pub mod time;

pub use candidate::Candidate;
pub use error::{ErrorBody, ErrorDetail, HttpError};
pub use money::{Multiplier, UsdMicros};
pub use routing::{
    ChannelGroup, ChannelKind, ChannelModel, Credential, CredentialSecret, DEFAULT_GROUP, RoutingGraph,
    UpstreamChannel, UpstreamEndpoint,
};

pub type ChannelId = i64;
pub type EndpointId = i64;
pub type CredentialId = i64;
pub type UserId = i64;
pub type TokenId = i64;
pub type SubscriptionId = i64;
pub type UsageEventId = i64;
