//! DynamoDB storage implementations.

mod lease_store;

pub use lease_store::DynamoLeaseStore;
