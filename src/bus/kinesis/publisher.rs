//! Publisher: sync and async publish modes over a [`StreamTransport`].

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use super::transport::{StreamTransport, UserRecordResult};
use crate::bus::{PublishResult, Result};
use crate::config::KinesisConfig;
use crate::event::Event;

/// Outcome of an async publish, logged by the callback task.
struct PublishOutcome {
    stream: String,
    partition_key: String,
    payload: Bytes,
    result: Result<UserRecordResult>,
}

impl PublishOutcome {
    fn log(&self) {
        let payload = String::from_utf8_lossy(&self.payload);
        match &self.result {
            Ok(ack) if ack.success => debug!(
                stream = %self.stream,
                partition_key = %self.partition_key,
                shard_id = ack.shard_id.as_deref().unwrap_or(""),
                sequence_number = ack.sequence_number.as_deref().unwrap_or(""),
                attempts = ack.attempts.len(),
                "Successfully published event"
            ),
            Ok(ack) => log_failed_ack(&self.stream, &self.partition_key, &payload, ack),
            Err(e) => error!(
                stream = %self.stream,
                partition_key = %self.partition_key,
                payload = %payload,
                error = %e,
                "Error when publishing event"
            ),
        }
    }
}

/// Log the last failed attempt and, when there is one, the attempt before it.
fn log_failed_ack(stream: &str, partition_key: &str, payload: &str, ack: &UserRecordResult) {
    match ack.attempts.as_slice() {
        [.., previous, last] => error!(
            stream = %stream,
            partition_key = %partition_key,
            payload = %payload,
            attempts = ack.attempts.len(),
            error_code = last.error_code.as_deref().unwrap_or(""),
            error_message = last.error_message.as_deref().unwrap_or(""),
            previous_error_code = previous.error_code.as_deref().unwrap_or(""),
            previous_error_message = previous.error_message.as_deref().unwrap_or(""),
            "Failed publishing event"
        ),
        [last] => error!(
            stream = %stream,
            partition_key = %partition_key,
            payload = %payload,
            attempts = 1,
            error_code = last.error_code.as_deref().unwrap_or(""),
            error_message = last.error_message.as_deref().unwrap_or(""),
            "Failed publishing event"
        ),
        [] => error!(
            stream = %stream,
            partition_key = %partition_key,
            payload = %payload,
            "Failed publishing event without attempt details"
        ),
    }
}

/// Single task logging async publish outcomes in arrival order.
fn spawn_callback_logger() -> mpsc::UnboundedSender<PublishOutcome> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PublishOutcome>();
    tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            outcome.log();
        }
    });
    tx
}

/// Publishes records to streams.
///
/// With `send_async` the call returns `success(1)` right after submission and
/// the outcome is only logged. Otherwise the call waits up to
/// `publish_timeout` for the acknowledgment.
pub struct KinesisPublisher {
    transport: Arc<dyn StreamTransport>,
    config: Arc<KinesisConfig>,
    callbacks: OnceLock<mpsc::UnboundedSender<PublishOutcome>>,
}

impl KinesisPublisher {
    pub fn new(transport: Arc<dyn StreamTransport>, config: Arc<KinesisConfig>) -> Self {
        Self {
            transport,
            config,
            callbacks: OnceLock::new(),
        }
    }

    /// Publish `payload` to `stream`, in the mode the configuration selects.
    pub async fn publish(&self, stream: &str, payload: Bytes, partition_key: &str) -> PublishResult {
        if self.config.send_async {
            self.publish_async(stream, payload, partition_key)
        } else {
            self.publish_sync(stream, payload, partition_key).await
        }
    }

    /// Publish a host event to the configured topic, keyed by its type.
    pub async fn on_event(&self, event: &Event) {
        match serde_json::to_vec(event) {
            Ok(payload) => {
                self.publish(&self.config.topic, Bytes::from(payload), &event.event_type)
                    .await;
            }
            Err(e) => error!(
                event_type = %event.event_type,
                error = %e,
                "Failed to serialize event"
            ),
        }
    }

    async fn publish_sync(&self, stream: &str, payload: Bytes, partition_key: &str) -> PublishResult {
        trace!(stream = %stream, partition_key = %partition_key, "Publishing event synchronously");

        let pending = match self
            .transport
            .put_record(stream, partition_key, payload.clone())
        {
            Ok(pending) => pending,
            Err(e) => {
                error!(
                    stream = %stream,
                    partition_key = %partition_key,
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Error when publishing event"
                );
                return PublishResult::failure(0);
            }
        };

        let timeout = self.config.publish_timeout();
        match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(ack)) if ack.success => {
                debug!(
                    stream = %stream,
                    partition_key = %partition_key,
                    shard_id = ack.shard_id.as_deref().unwrap_or(""),
                    sequence_number = ack.sequence_number.as_deref().unwrap_or(""),
                    attempts = ack.attempts.len(),
                    "Successfully published event"
                );
                PublishResult::success(ack.attempts.len() as u32)
            }
            Ok(Ok(ack)) => {
                log_failed_ack(
                    stream,
                    partition_key,
                    &String::from_utf8_lossy(&payload),
                    &ack,
                );
                PublishResult::failure(ack.attempts.len() as u32)
            }
            Ok(Err(e)) => {
                error!(
                    stream = %stream,
                    partition_key = %partition_key,
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Error when publishing event"
                );
                PublishResult::failure(0)
            }
            Err(_) => {
                error!(
                    stream = %stream,
                    partition_key = %partition_key,
                    payload = %String::from_utf8_lossy(&payload),
                    timeout = ?timeout,
                    "Timeout when publishing event"
                );
                PublishResult::failure(0)
            }
        }
    }

    fn publish_async(&self, stream: &str, payload: Bytes, partition_key: &str) -> PublishResult {
        trace!(stream = %stream, partition_key = %partition_key, "Publishing event asynchronously");

        let pending = match self
            .transport
            .put_record(stream, partition_key, payload.clone())
        {
            Ok(pending) => pending,
            Err(e) => {
                error!(
                    stream = %stream,
                    partition_key = %partition_key,
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Error when publishing event"
                );
                return PublishResult::failure(1);
            }
        };

        let callbacks = self.callbacks.get_or_init(spawn_callback_logger).clone();
        let stream = stream.to_string();
        let partition_key = partition_key.to_string();
        tokio::spawn(async move {
            let result = pending.await;
            // Send fails only when the logger task is gone.
            let _ = callbacks.send(PublishOutcome {
                stream,
                partition_key,
                payload,
                result,
            });
        });

        PublishResult::success(1)
    }
}
