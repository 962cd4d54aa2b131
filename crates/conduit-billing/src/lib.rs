//! Usage billing: pricing, quota strategies and the reserve/commit ledger

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod error;
mod ledger;
pub mod pricing;
mod provider;

pub use error::BillingError;
pub use ledger::Ledger;
pub use provider::{
    CommitRequest, Estimate, FeatureProvider, FreeProvider, HybridProvider, PaygProvider, Pricer, QuotaProvider,
    Reservation, ReserveRequest, SubscriptionProvider,
};
