//! Lease and checkpoint storage.
//!
//! Every topic has one lease table (`{application_name}-{topic}`) holding one
//! row per shard, keyed by `leaseKey`. The `checkpoint` attribute is either a
//! sequence number or one of the sentinels `TRIM_HORIZON` / `LATEST`.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::bus::Result;

#[cfg(feature = "kinesis")]
pub mod dynamo;
pub mod mock;

#[cfg(feature = "kinesis")]
pub use dynamo::DynamoLeaseStore;
pub use mock::InMemoryLeaseStore;

/// Hash key attribute of a lease row.
pub const LEASE_KEY_ATTRIBUTE: &str = "leaseKey";
/// Checkpoint attribute of a lease row.
pub const CHECKPOINT_ATTRIBUTE: &str = "checkpoint";
/// Checkpoint sentinel: oldest retained record.
pub const TRIM_HORIZON: &str = "TRIM_HORIZON";
/// Checkpoint sentinel: records published from now on.
pub const LATEST: &str = "LATEST";

/// Storage of shard leases for one or more lease tables.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// All shard keys of `table`. Empty when the table does not exist.
    async fn scan_shard_keys(&self, table: &str) -> Result<HashSet<String>>;

    /// Overwrite the checkpoint of `shard`, returning the previous value.
    async fn update_checkpoint(
        &self,
        table: &str,
        shard: &str,
        checkpoint: &str,
    ) -> Result<Option<String>>;

    /// Current checkpoint of `shard`, `None` when the lease row is absent.
    async fn get_checkpoint(&self, table: &str, shard: &str) -> Result<Option<String>>;

    /// Write `checkpoint` only if the stored value still equals `expected`.
    ///
    /// `expected == None` means "only if the row does not exist yet". Returns
    /// false when the condition did not hold.
    async fn compare_and_set_checkpoint(
        &self,
        table: &str,
        shard: &str,
        expected: Option<&str>,
        checkpoint: &str,
    ) -> Result<bool>;

    /// Create `table` if it does not exist.
    async fn ensure_table(&self, table: &str) -> Result<()>;
}
