//! Shared fixtures for the integration suites
//!
//! Each test binary pulls in the whole harness but only uses part of it.

#![allow(dead_code)]

pub mod fixture;
pub mod mock_upstream;
pub mod server;
