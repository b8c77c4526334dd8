//! In-memory lease store for testing and standalone runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::LeaseStore;
use crate::bus::{BusError, Result};

type LeaseTable = BTreeMap<String, String>;

/// Lease store that keeps every table in memory.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    tables: RwLock<HashMap<String, LeaseTable>>,
    fail_on_update: RwLock<bool>,
    response_delay: RwLock<Option<Duration>>,
    updates: RwLock<usize>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, table: &str) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default();
    }

    /// Insert or replace a lease row, creating the table when needed.
    pub async fn put_lease(&self, table: &str, shard: &str, checkpoint: &str) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(shard.to_string(), checkpoint.to_string());
    }

    /// Drop a lease row, as another worker taking the shard over would.
    pub async fn remove_lease(&self, table: &str, shard: &str) {
        if let Some(leases) = self.tables.write().await.get_mut(table) {
            leases.remove(shard);
        }
    }

    /// Snapshot of `table`, `None` when it does not exist.
    pub async fn leases(&self, table: &str) -> Option<BTreeMap<String, String>> {
        self.tables.read().await.get(table).cloned()
    }

    pub async fn set_fail_on_update(&self, fail: bool) {
        *self.fail_on_update.write().await = fail;
    }

    /// Delay every scan and update by `delay`, for timeout tests.
    pub async fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.write().await = delay;
    }

    /// Number of `update_checkpoint` calls that reached the store.
    pub async fn update_count(&self) -> usize {
        *self.updates.read().await
    }

    async fn delay(&self) {
        let delay = *self.response_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn scan_shard_keys(&self, table: &str) -> Result<HashSet<String>> {
        self.delay().await;
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|leases| leases.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_checkpoint(
        &self,
        table: &str,
        shard: &str,
        checkpoint: &str,
    ) -> Result<Option<String>> {
        self.delay().await;
        *self.updates.write().await += 1;
        if *self.fail_on_update.read().await {
            return Err(BusError::LeaseStore("Mock update failure".to_string()));
        }

        let mut tables = self.tables.write().await;
        let leases = tables
            .get_mut(table)
            .ok_or_else(|| BusError::LeaseStore(format!("Table not found: {}", table)))?;
        Ok(leases.insert(shard.to_string(), checkpoint.to_string()))
    }

    async fn get_checkpoint(&self, table: &str, shard: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|leases| leases.get(shard).cloned()))
    }

    async fn compare_and_set_checkpoint(
        &self,
        table: &str,
        shard: &str,
        expected: Option<&str>,
        checkpoint: &str,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let leases = tables
            .get_mut(table)
            .ok_or_else(|| BusError::LeaseStore(format!("Table not found: {}", table)))?;

        if leases.get(shard).map(String::as_str) != expected {
            return Ok(false);
        }
        leases.insert(shard.to_string(), checkpoint.to_string());
        Ok(true)
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        self.create_table(table).await;
        Ok(())
    }
}
