//! Record dispatch.
//!
//! Decodes raw stream records into `EventMessage`s and hands them to the
//! subscriber's handler. Failures are isolated per record; a handler panic is
//! the one unrecoverable case and is surfaced as `BusError::Fatal`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info};

use super::kinesis::engine::ShardRecordProcessor;
use super::kinesis::transport::StreamRecord;
use super::{BusError, EventHandler, Result};
use crate::event::EventMessage;

/// Result of processing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// The handler accepted the event.
    Success,
    /// The handler returned an error. The record is not retried.
    HandlerFailed,
    /// Payload could not be decoded, no retry will help.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if the handler accepted the event.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

/// Process a record payload through `handler`.
///
/// # Returns
/// * `Ok(DispatchResult::Success)` - Handler succeeded
/// * `Ok(DispatchResult::HandlerFailed)` - Handler returned an error (logged)
/// * `Ok(DispatchResult::DecodeError)` - Payload is not an `EventMessage` (logged)
/// * `Err(BusError::Fatal)` - Handler panicked
pub async fn process_record(
    payload: &[u8],
    handler: &Arc<dyn EventHandler>,
) -> Result<DispatchResult> {
    let event = match EventMessage::from_json_bytes(payload) {
        Ok(event) => Arc::new(event),
        Err(e) => {
            error!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "Malformed event"
            );
            return Ok(DispatchResult::DecodeError);
        }
    };
    let event_id = event.header.event_id;

    // Building the handler future happens inside the guarded block so a
    // panic there is caught too.
    let handled = AssertUnwindSafe(async { handler.handle(event).await })
        .catch_unwind()
        .await;

    match handled {
        Ok(Ok(())) => Ok(DispatchResult::Success),
        Ok(Err(e)) => {
            error!(event_id = %event_id, error = %e, "Handler failed");
            Ok(DispatchResult::HandlerFailed)
        }
        Err(panic) => Err(BusError::Fatal(format!(
            "handler panicked on event {}: {}",
            event_id,
            panic_message(panic.as_ref())
        ))),
    }
}

/// Per-topic record processor handed to the consumption engine.
pub struct RecordDispatcher {
    topic: String,
    handler: Arc<dyn EventHandler>,
}

impl RecordDispatcher {
    pub fn new(topic: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            topic: topic.into(),
            handler,
        }
    }
}

#[async_trait]
impl ShardRecordProcessor for RecordDispatcher {
    async fn initialize(&self, shard_id: &str, checkpoint: &str) {
        info!(
            topic = %self.topic,
            shard_id = %shard_id,
            checkpoint = %checkpoint,
            "Initializing shard"
        );
    }

    async fn process_records(&self, shard_id: &str, records: Vec<StreamRecord>) -> Result<usize> {
        info!(topic = %self.topic, records = records.len(), "Processing records");

        let mut handled = 0;
        for record in &records {
            debug!(
                partition_key = %record.partition_key,
                sequence_number = %record.sequence_number,
                "Processing record"
            );
            match process_record(&record.data, &self.handler).await {
                Ok(result) if result.is_success() => handled += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        topic = %self.topic,
                        shard_id = %shard_id,
                        sequence_number = %record.sequence_number,
                        error = %e,
                        "Unrecoverable failure while processing records, aborting"
                    );
                    return Err(e);
                }
            }
        }
        Ok(handled)
    }

    async fn lease_lost(&self, shard_id: &str) {
        info!(topic = %self.topic, shard_id = %shard_id, "Lost lease, terminating shard consumer");
    }

    async fn shard_ended(&self, shard_id: &str) {
        info!(topic = %self.topic, shard_id = %shard_id, "Reached shard end");
    }

    async fn shutdown_requested(&self, shard_id: &str) {
        info!(topic = %self.topic, shard_id = %shard_id, "Scheduler is shutting down");
    }
}
