//! Checkpoint reset: rewinds every shard lease of a topic to `TRIM_HORIZON`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::lease_table_name;
use crate::storage::{LeaseStore, TRIM_HORIZON};

/// Bound on each lease table scan and update.
pub const LEASE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Forces every shard of a topic's lease table back to the earliest position.
pub struct CheckpointResetter {
    application_name: String,
    leases: Arc<dyn LeaseStore>,
    response_timeout: Duration,
}

impl CheckpointResetter {
    pub fn new(application_name: impl Into<String>, leases: Arc<dyn LeaseStore>) -> Self {
        Self {
            application_name: application_name.into(),
            leases,
            response_timeout: LEASE_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Set the checkpoint of every lease of `topic` to `TRIM_HORIZON`.
    ///
    /// Best-effort: a store error or timeout is logged and the remaining
    /// shards are skipped. A missing lease table means nothing to reset.
    /// Returns the number of shards reset.
    pub async fn reset_all_shards(&self, topic: &str) -> usize {
        let table = lease_table_name(&self.application_name, topic);

        let shards = match tokio::time::timeout(
            self.response_timeout,
            self.leases.scan_shard_keys(&table),
        )
        .await
        {
            Ok(Ok(shards)) => shards,
            Ok(Err(e)) => {
                error!(lease_table = %table, error = %e, "Error while scanning lease table, nothing reset");
                return 0;
            }
            Err(_) => {
                error!(
                    lease_table = %table,
                    timeout = ?self.response_timeout,
                    "Timeout while scanning lease table, nothing reset"
                );
                return 0;
            }
        };

        if shards.is_empty() {
            debug!(lease_table = %table, "No shard leases to reset");
            return 0;
        }

        let mut shards: Vec<String> = shards.into_iter().collect();
        shards.sort();

        let mut reset = 0;
        for shard in &shards {
            info!(lease_table = %table, shard_id = %shard, "Resetting checkpoint");
            match tokio::time::timeout(
                self.response_timeout,
                self.leases.update_checkpoint(&table, shard, TRIM_HORIZON),
            )
            .await
            {
                Ok(Ok(previous)) => {
                    info!(
                        lease_table = %table,
                        shard_id = %shard,
                        previous = previous.as_deref().unwrap_or("<none>"),
                        "Reset checkpoint to TRIM_HORIZON"
                    );
                    reset += 1;
                }
                Ok(Err(e)) => {
                    error!(
                        lease_table = %table,
                        shard_id = %shard,
                        error = %e,
                        skipped = shards.len() - reset - 1,
                        "Error while resetting checkpoint"
                    );
                    break;
                }
                Err(_) => {
                    error!(
                        lease_table = %table,
                        shard_id = %shard,
                        timeout = ?self.response_timeout,
                        skipped = shards.len() - reset - 1,
                        "Timeout while resetting checkpoint"
                    );
                    break;
                }
            }
        }
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryLeaseStore;

    #[tokio::test]
    async fn test_missing_table_is_nothing_to_reset() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let resetter = CheckpointResetter::new("app", store.clone());

        assert_eq!(resetter.reset_all_shards("t1").await, 0);
        assert_eq!(store.update_count().await, 0);
        assert!(store.leases("app-t1").await.is_none());
    }

    #[tokio::test]
    async fn test_every_shard_reset_to_trim_horizon() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.put_lease("app-t1", "shardId-000000000000", "00000000000000000003").await;
        store.put_lease("app-t1", "shardId-000000000001", "LATEST").await;
        store.put_lease("app-t1", "shardId-000000000002", "TRIM_HORIZON").await;
        // Another topic's table is left alone.
        store.put_lease("app-t2", "shardId-000000000000", "LATEST").await;

        let resetter = CheckpointResetter::new("app", store.clone());
        assert_eq!(resetter.reset_all_shards("t1").await, 3);

        let leases = store.leases("app-t1").await.unwrap();
        assert_eq!(leases.len(), 3);
        assert!(leases.values().all(|c| c == TRIM_HORIZON));
        assert_eq!(
            store.leases("app-t2").await.unwrap()["shardId-000000000000"],
            "LATEST"
        );
    }

    #[tokio::test]
    async fn test_update_error_skips_remaining_shards() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.put_lease("app-t1", "s0", "1").await;
        store.put_lease("app-t1", "s1", "2").await;
        store.set_fail_on_update(true).await;

        let resetter = CheckpointResetter::new("app", store.clone());
        assert_eq!(resetter.reset_all_shards("t1").await, 0);
        assert_eq!(store.update_count().await, 1);
        assert_eq!(store.leases("app-t1").await.unwrap()["s1"], "2");
    }

    #[tokio::test]
    async fn test_slow_store_times_out_without_raising() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store.put_lease("app-t1", "s0", "1").await;
        store
            .set_response_delay(Some(Duration::from_millis(200)))
            .await;

        let resetter = CheckpointResetter::new("app", store.clone())
            .with_response_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();

        assert_eq!(resetter.reset_all_shards("t1").await, 0);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(store.leases("app-t1").await.unwrap()["s0"], "1");
    }
}
