//! Shared helpers: tracing setup and backoff policies.

pub mod bootstrap;
pub mod retry;
