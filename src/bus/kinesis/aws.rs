//! Kinesis-backed stream transport and shard reader.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_kinesis::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use backon::BackoffBuilder;
use bytes::Bytes;
use tracing::{debug, trace};

use super::transport::{
    validate_record, Attempt, IteratorPosition, PutRecordFuture, RecordBatch, ShardReader,
    StreamRecord, StreamTransport, UserRecordResult,
};
use crate::bus::{BusError, Result};
use crate::utils::retry;

/// Kinesis client implementing both stream seams.
///
/// `put_record` retries each record until it is acknowledged or until the
/// record time-to-live runs out. Each individual request is bounded by the
/// single-request timeout.
#[derive(Clone)]
pub struct KinesisStreamClient {
    client: Client,
    single_request_timeout: Duration,
    record_ttl: Duration,
}

impl KinesisStreamClient {
    pub fn new(client: Client, single_request_timeout: Duration, record_ttl: Duration) -> Self {
        Self {
            client,
            single_request_timeout,
            record_ttl,
        }
    }
}

async fn put_with_retries(
    client: Client,
    stream: Arc<str>,
    partition_key: Arc<str>,
    data: Bytes,
    single_request_timeout: Duration,
    record_ttl: Duration,
) -> Result<UserRecordResult> {
    let deadline = Instant::now() + record_ttl;
    let mut backoff = retry::publish_backoff().build();
    let mut attempts = Vec::new();

    loop {
        let started = Instant::now();
        let request = client
            .put_record()
            .stream_name(stream.as_ref())
            .partition_key(partition_key.as_ref())
            .data(Blob::new(data.to_vec()))
            .send();

        match tokio::time::timeout(single_request_timeout, request).await {
            Ok(Ok(output)) => {
                attempts.push(Attempt::succeeded(started.elapsed()));
                return Ok(UserRecordResult::succeeded(
                    output.shard_id(),
                    output.sequence_number(),
                    attempts,
                ));
            }
            Ok(Err(e)) => {
                let code = e
                    .as_service_error()
                    .and_then(|se| se.code())
                    .unwrap_or("Exception")
                    .to_string();
                trace!(stream = %stream, error_code = %code, "Put record attempt failed");
                attempts.push(Attempt::failed(
                    code,
                    DisplayErrorContext(&e).to_string(),
                    started.elapsed(),
                ));
            }
            Err(_) => {
                attempts.push(Attempt::failed(
                    "Expired",
                    format!(
                        "Request did not complete within {:?}",
                        single_request_timeout
                    ),
                    started.elapsed(),
                ));
            }
        }

        match backoff.next() {
            Some(delay) if Instant::now() + delay < deadline => tokio::time::sleep(delay).await,
            _ => return Ok(UserRecordResult::failed(attempts)),
        }
    }
}

impl StreamTransport for KinesisStreamClient {
    fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordFuture> {
        validate_record(partition_key, &data)?;

        Ok(Box::pin(put_with_retries(
            self.client.clone(),
            Arc::from(stream),
            Arc::from(partition_key),
            data,
            self.single_request_timeout,
            self.record_ttl,
        )))
    }
}

#[async_trait]
impl ShardReader for KinesisStreamClient {
    async fn list_shards(&self, stream: &str) -> Result<Vec<String>> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // A continuation request must carry the token and no stream name.
            let request = match next_token.take() {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(stream),
            };
            let response = request.send().await.map_err(|e| {
                BusError::Subscribe(format!(
                    "Kinesis list_shards failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

            shards.extend(response.shards().iter().map(|s| s.shard_id().to_string()));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %stream, shards = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<String> {
        let request = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(shard_id);
        let request = match position {
            IteratorPosition::TrimHorizon => {
                request.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
            IteratorPosition::Latest => request.shard_iterator_type(ShardIteratorType::Latest),
            IteratorPosition::AfterSequenceNumber(sequence) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(sequence),
        };

        let response = request.send().await.map_err(|e| {
            BusError::Subscribe(format!(
                "Kinesis get_shard_iterator failed: {}",
                DisplayErrorContext(&e)
            ))
        })?;

        response
            .shard_iterator()
            .map(str::to_string)
            .ok_or_else(|| BusError::Subscribe(format!("No iterator returned for {}", shard_id)))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch> {
        let response = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(|e| {
                BusError::Subscribe(format!(
                    "Kinesis get_records failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let records = response
            .records()
            .iter()
            .map(|record| StreamRecord {
                partition_key: record.partition_key().unwrap_or_default().to_string(),
                sequence_number: record.sequence_number().to_string(),
                data: Bytes::copy_from_slice(record.data().as_ref()),
            })
            .collect();

        Ok(RecordBatch {
            records,
            next_iterator: response.next_shard_iterator().map(str::to_string),
        })
    }
}
