//! DynamoDB LeaseStore implementation.
//!
//! Table schema:
//! - PK: `leaseKey` (String), the shard id
//! - checkpoint: sequence number or `TRIM_HORIZON` / `LATEST` (String)

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType, ReturnValue,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Result};
use crate::storage::{LeaseStore, CHECKPOINT_ATTRIBUTE, LEASE_KEY_ATTRIBUTE};

const TABLE_ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TABLE_ACTIVE_MAX_POLLS: usize = 60;

/// DynamoDB implementation of LeaseStore.
#[derive(Clone)]
pub struct DynamoLeaseStore {
    client: Client,
}

impl DynamoLeaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn key(shard: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([(
            LEASE_KEY_ATTRIBUTE.to_string(),
            AttributeValue::S(shard.to_string()),
        )])
    }

    fn checkpoint_of(item: Option<&HashMap<String, AttributeValue>>) -> Option<String> {
        item.and_then(|item| item.get(CHECKPOINT_ATTRIBUTE))
            .and_then(|value| value.as_s().ok())
            .cloned()
    }

    async fn wait_until_active(&self, table: &str) -> Result<()> {
        for _ in 0..TABLE_ACTIVE_MAX_POLLS {
            let response = self
                .client
                .describe_table()
                .table_name(table)
                .send()
                .await
                .map_err(|e| {
                    BusError::LeaseStore(format!(
                        "DynamoDB describe_table failed: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            if response.table().and_then(|t| t.table_status()) == Some(&TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(TABLE_ACTIVE_POLL_INTERVAL).await;
        }
        Err(BusError::LeaseStore(format!(
            "Lease table {} did not become active",
            table
        )))
    }
}

#[async_trait]
impl LeaseStore for DynamoLeaseStore {
    async fn scan_shard_keys(&self, table: &str) -> Result<HashSet<String>> {
        let mut shards = HashSet::new();
        let mut start_key = None;

        loop {
            let response = match self
                .client
                .scan()
                .table_name(table)
                .projection_expression(LEASE_KEY_ATTRIBUTE)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
            {
                Ok(response) => response,
                Err(e)
                    if e.as_service_error()
                        .is_some_and(|se| se.is_resource_not_found_exception()) =>
                {
                    warn!(lease_table = %table, "Lease table does not exist");
                    return Ok(HashSet::new());
                }
                Err(e) => {
                    return Err(BusError::LeaseStore(format!(
                        "DynamoDB scan failed: {}",
                        DisplayErrorContext(&e)
                    )))
                }
            };

            shards.extend(response.items().iter().filter_map(|item| {
                item.get(LEASE_KEY_ATTRIBUTE)
                    .and_then(|value| value.as_s().ok())
                    .cloned()
            }));

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        debug!(lease_table = %table, shards = shards.len(), "Scanned lease table");
        Ok(shards)
    }

    async fn update_checkpoint(
        &self,
        table: &str,
        shard: &str,
        checkpoint: &str,
    ) -> Result<Option<String>> {
        let response = self
            .client
            .update_item()
            .table_name(table)
            .set_key(Some(Self::key(shard)))
            .update_expression("SET #checkpoint = :checkpoint")
            .expression_attribute_names("#checkpoint", CHECKPOINT_ATTRIBUTE)
            .expression_attribute_values(":checkpoint", AttributeValue::S(checkpoint.to_string()))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| {
                BusError::LeaseStore(format!(
                    "DynamoDB update_item failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(Self::checkpoint_of(response.attributes()))
    }

    async fn get_checkpoint(&self, table: &str, shard: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(Self::key(shard)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| {
                BusError::LeaseStore(format!(
                    "DynamoDB get_item failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(Self::checkpoint_of(response.item()))
    }

    async fn compare_and_set_checkpoint(
        &self,
        table: &str,
        shard: &str,
        expected: Option<&str>,
        checkpoint: &str,
    ) -> Result<bool> {
        let request = self
            .client
            .update_item()
            .table_name(table)
            .set_key(Some(Self::key(shard)))
            .update_expression("SET #checkpoint = :checkpoint")
            .expression_attribute_names("#checkpoint", CHECKPOINT_ATTRIBUTE)
            .expression_attribute_values(":checkpoint", AttributeValue::S(checkpoint.to_string()));

        let request = match expected {
            Some(expected) => request
                .condition_expression("#checkpoint = :expected")
                .expression_attribute_values(":expected", AttributeValue::S(expected.to_string())),
            None => request
                .condition_expression("attribute_not_exists(#lease_key)")
                .expression_attribute_names("#lease_key", LEASE_KEY_ATTRIBUTE),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(BusError::LeaseStore(format!(
                "DynamoDB conditional update failed: {}",
                DisplayErrorContext(&e)
            ))),
        }
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(_) => return self.wait_until_active(table).await,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) => {}
            Err(e) => {
                return Err(BusError::LeaseStore(format!(
                    "DynamoDB describe_table failed: {}",
                    DisplayErrorContext(&e)
                )))
            }
        }

        let key_schema = KeySchemaElement::builder()
            .attribute_name(LEASE_KEY_ATTRIBUTE)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| BusError::LeaseStore(e.to_string()))?;
        let key_attribute = AttributeDefinition::builder()
            .attribute_name(LEASE_KEY_ATTRIBUTE)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| BusError::LeaseStore(e.to_string()))?;

        match self
            .client
            .create_table()
            .table_name(table)
            .key_schema(key_schema)
            .attribute_definitions(key_attribute)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
        {
            Ok(_) => info!(lease_table = %table, "Created lease table"),
            // Another worker created it first.
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_in_use_exception()) => {}
            Err(e) => {
                return Err(BusError::LeaseStore(format!(
                    "DynamoDB create_table failed: {}",
                    DisplayErrorContext(&e)
                )))
            }
        }

        self.wait_until_active(table).await
    }
}
