#![allow(clippy::must_use_candidate)]

mod cache;
mod error;
mod resolver;

pub use cache::TokenAuthCache;
pub use error::AuthError;
pub use resolver::{TokenResolver, bearer_token, sha256_hex};
