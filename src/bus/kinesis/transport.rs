//! Stream transport seams: writing records and reading shards.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::bus::{BusError, Result};
use crate::storage::{LATEST, TRIM_HORIZON};

/// Longest partition key accepted by the stream.
pub const MAX_PARTITION_KEY_LEN: usize = 256;
/// Largest record payload accepted by the stream.
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// One try of a put-record call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration: Duration,
}

impl Attempt {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            success: true,
            error_code: None,
            error_message: None,
            duration,
        }
    }

    pub fn failed(
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            duration,
        }
    }
}

/// Acknowledged outcome of one record, with every attempt made for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecordResult {
    pub success: bool,
    pub shard_id: Option<String>,
    pub sequence_number: Option<String>,
    pub attempts: Vec<Attempt>,
}

impl UserRecordResult {
    pub fn succeeded(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
        attempts: Vec<Attempt>,
    ) -> Self {
        Self {
            success: true,
            shard_id: Some(shard_id.into()),
            sequence_number: Some(sequence_number.into()),
            attempts,
        }
    }

    pub fn failed(attempts: Vec<Attempt>) -> Self {
        Self {
            success: false,
            shard_id: None,
            sequence_number: None,
            attempts,
        }
    }
}

/// Future resolving once the transport stops retrying a record.
pub type PutRecordFuture = BoxFuture<'static, Result<UserRecordResult>>;

/// Writes records to a stream.
pub trait StreamTransport: Send + Sync {
    /// Submit one record.
    ///
    /// The outer `Result` is submission: invalid records are rejected here
    /// before any network traffic. The returned future resolves after the
    /// transport's own retries finished.
    fn put_record(&self, stream: &str, partition_key: &str, data: Bytes)
        -> Result<PutRecordFuture>;
}

/// Check the limits the stream enforces on every record.
pub fn validate_record(partition_key: &str, data: &[u8]) -> Result<()> {
    let key_len = partition_key.chars().count();
    if key_len == 0 || key_len > MAX_PARTITION_KEY_LEN {
        return Err(BusError::Publish(format!(
            "Partition key must be 1 to {} characters, got {}",
            MAX_PARTITION_KEY_LEN, key_len
        )));
    }
    if data.len() > MAX_RECORD_SIZE {
        return Err(BusError::Publish(format!(
            "Record of {} bytes exceeds the {} byte limit",
            data.len(),
            MAX_RECORD_SIZE
        )));
    }
    Ok(())
}

/// A record read from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub partition_key: String,
    pub sequence_number: String,
    pub data: Bytes,
}

/// Where a shard iterator starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    TrimHorizon,
    Latest,
    AfterSequenceNumber(String),
}

impl IteratorPosition {
    /// Interpret a stored lease checkpoint.
    pub fn from_checkpoint(checkpoint: &str) -> Self {
        match checkpoint {
            TRIM_HORIZON => Self::TrimHorizon,
            LATEST => Self::Latest,
            sequence => Self::AfterSequenceNumber(sequence.to_string()),
        }
    }
}

/// One `get_records` page.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<StreamRecord>,
    /// `None` once a closed shard has been read to its end.
    pub next_iterator: Option<String>,
}

/// Reads shards of a stream.
#[async_trait]
pub trait ShardReader: Send + Sync {
    async fn list_shards(&self, stream: &str) -> Result<Vec<String>>;

    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<String>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_partition_key() {
        assert!(validate_record("", b"{}").is_err());
    }

    #[test]
    fn test_validate_rejects_long_partition_key() {
        let key = "k".repeat(MAX_PARTITION_KEY_LEN + 1);
        assert!(validate_record(&key, b"{}").is_err());
        assert!(validate_record(&key[..MAX_PARTITION_KEY_LEN], b"{}").is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let payload = vec![b'x'; MAX_RECORD_SIZE + 1];
        assert!(validate_record("key", &payload).is_err());
        assert!(validate_record("key", &payload[..MAX_RECORD_SIZE]).is_ok());
    }

    #[test]
    fn test_iterator_position_from_checkpoint() {
        assert_eq!(
            IteratorPosition::from_checkpoint("TRIM_HORIZON"),
            IteratorPosition::TrimHorizon
        );
        assert_eq!(
            IteratorPosition::from_checkpoint("LATEST"),
            IteratorPosition::Latest
        );
        assert_eq!(
            IteratorPosition::from_checkpoint("49590338271490256608559692538361571095921575989136588898"),
            IteratorPosition::AfterSequenceNumber(
                "49590338271490256608559692538361571095921575989136588898".to_string()
            )
        );
    }
}
