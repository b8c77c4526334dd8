//! External service clients.

#[cfg(feature = "kinesis")]
pub mod aws;
