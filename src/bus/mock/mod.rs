//! In-memory stream, engine and handler for testing.
//!
//! [`MemoryStream`] implements both stream seams, so a [`KinesisBroker`]
//! built from [`MemoryStream::broker_parts`] runs the real consumer,
//! dispatcher and polling engine without AWS.
//!
//! [`KinesisBroker`]: crate::bus::KinesisBroker

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{watch, RwLock};

use super::kinesis::engine::{ConsumptionEngine, EngineConfig, EngineRun, PollingEngine, ShardRecordProcessor};
use super::kinesis::transport::{
    validate_record, Attempt, IteratorPosition, PutRecordFuture, RecordBatch, ShardReader,
    StreamRecord, StreamTransport, UserRecordResult,
};
use super::kinesis::BrokerParts;
use super::{BusError, EventHandler, Result};
use crate::event::EventMessage;
use crate::storage::InMemoryLeaseStore;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_RECORD_TTL: Duration = Duration::from_millis(500);

fn shard_name(index: usize) -> String {
    format!("shardId-{:012}", index)
}

fn shard_index(shard_id: &str) -> Result<usize> {
    shard_id
        .strip_prefix("shardId-")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| BusError::Subscribe(format!("Unknown shard: {}", shard_id)))
}

struct StreamState {
    streams: RwLock<HashMap<String, Vec<Vec<StreamRecord>>>>,
    next_sequence: AtomicU64,
    hang_puts: AtomicBool,
    put_calls: AtomicUsize,
    retry_interval: Duration,
    record_ttl: Duration,
}

impl StreamState {
    /// Append to the shard owning `partition_key`. `None` when the stream
    /// does not exist.
    async fn append(&self, stream: &str, partition_key: &str, data: Bytes) -> Option<(String, String)> {
        let mut streams = self.streams.write().await;
        let shards = streams.get_mut(stream)?;

        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        let index = (hasher.finish() % shards.len() as u64) as usize;

        let sequence_number = format!("{:020}", self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1);
        shards[index].push(StreamRecord {
            partition_key: partition_key.to_string(),
            sequence_number: sequence_number.clone(),
            data,
        });
        Some((shard_name(index), sequence_number))
    }
}

/// In-memory sharded stream.
///
/// Puts to a missing stream are retried every 50ms until the record
/// time-to-live runs out, the way the Kinesis transport behaves.
#[derive(Clone)]
pub struct MemoryStream {
    state: Arc<StreamState>,
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::with_record_ttl(DEFAULT_RECORD_TTL)
    }

    pub fn with_record_ttl(record_ttl: Duration) -> Self {
        Self {
            state: Arc::new(StreamState {
                streams: RwLock::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                hang_puts: AtomicBool::new(false),
                put_calls: AtomicUsize::new(0),
                retry_interval: DEFAULT_RETRY_INTERVAL,
                record_ttl,
            }),
        }
    }

    /// Create `name` with `shard_count` empty shards. Existing streams are kept.
    pub async fn create_stream(&self, name: &str, shard_count: usize) {
        self.state
            .streams
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); shard_count.max(1)]);
    }

    /// Every record of `stream`, shard by shard.
    pub async fn records(&self, stream: &str) -> Vec<StreamRecord> {
        self.state
            .streams
            .read()
            .await
            .get(stream)
            .map(|shards| shards.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every later put future never resolve.
    pub fn set_hang_puts(&self, hang: bool) {
        self.state.hang_puts.store(hang, Ordering::SeqCst);
    }

    /// Number of records submitted, valid or not.
    pub fn put_calls(&self) -> usize {
        self.state.put_calls.load(Ordering::SeqCst)
    }

    /// Polling engine reading this stream.
    pub fn engine(&self, leases: Arc<InMemoryLeaseStore>) -> PollingEngine {
        PollingEngine::new(Arc::new(self.clone()), leases)
    }

    /// Broker collaborators backed by this stream and `leases`.
    pub fn broker_parts(&self, leases: Arc<InMemoryLeaseStore>) -> BrokerParts {
        BrokerParts {
            transport: Arc::new(self.clone()),
            engine: Arc::new(self.engine(leases.clone())),
            leases,
        }
    }

    async fn shard_len(&self, stream: &str, shard: usize) -> Result<usize> {
        self.state
            .streams
            .read()
            .await
            .get(stream)
            .and_then(|shards| shards.get(shard))
            .map(Vec::len)
            .ok_or_else(|| BusError::Subscribe(format!("Stream {} not found", stream)))
    }
}

impl StreamTransport for MemoryStream {
    fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: Bytes,
    ) -> Result<PutRecordFuture> {
        self.state.put_calls.fetch_add(1, Ordering::SeqCst);
        validate_record(partition_key, &data)?;

        let state = self.state.clone();
        let stream = stream.to_string();
        let partition_key = partition_key.to_string();

        Ok(Box::pin(async move {
            if state.hang_puts.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }

            let started = Instant::now();
            let mut attempts = Vec::new();
            loop {
                let attempt_started = Instant::now();
                if let Some((shard_id, sequence_number)) =
                    state.append(&stream, &partition_key, data.clone()).await
                {
                    attempts.push(Attempt::succeeded(attempt_started.elapsed()));
                    return Ok(UserRecordResult::succeeded(shard_id, sequence_number, attempts));
                }

                attempts.push(Attempt::failed(
                    "ResourceNotFoundException",
                    format!("Stream {} not found", stream),
                    attempt_started.elapsed(),
                ));
                if started.elapsed() + state.retry_interval >= state.record_ttl {
                    return Ok(UserRecordResult::failed(attempts));
                }
                tokio::time::sleep(state.retry_interval).await;
            }
        }))
    }
}

#[async_trait]
impl ShardReader for MemoryStream {
    async fn list_shards(&self, stream: &str) -> Result<Vec<String>> {
        self.state
            .streams
            .read()
            .await
            .get(stream)
            .map(|shards| (0..shards.len()).map(shard_name).collect())
            .ok_or_else(|| BusError::Subscribe(format!("Stream {} not found", stream)))
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<String> {
        let shard = shard_index(shard_id)?;
        let offset = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => self.shard_len(stream, shard).await?,
            IteratorPosition::AfterSequenceNumber(sequence) => {
                let streams = self.state.streams.read().await;
                streams
                    .get(stream)
                    .and_then(|shards| shards.get(shard))
                    .map(|records| {
                        records.partition_point(|r| r.sequence_number.as_str() <= sequence.as_str())
                    })
                    .ok_or_else(|| BusError::Subscribe(format!("Stream {} not found", stream)))?
            }
        };
        Ok(format!("{}:{}:{}", offset, shard, stream))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch> {
        let mut parts = iterator.splitn(3, ':');
        let (Some(offset), Some(shard), Some(stream)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(BusError::Subscribe(format!("Invalid iterator: {}", iterator)));
        };
        let (Ok(offset), Ok(shard)) = (offset.parse::<usize>(), shard.parse::<usize>()) else {
            return Err(BusError::Subscribe(format!("Invalid iterator: {}", iterator)));
        };

        let streams = self.state.streams.read().await;
        let records = streams
            .get(stream)
            .and_then(|shards| shards.get(shard))
            .ok_or_else(|| BusError::Subscribe(format!("Stream {} not found", stream)))?;

        let end = records.len().min(offset + limit.max(0) as usize);
        let batch: Vec<StreamRecord> = records.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = offset + batch.len();

        Ok(RecordBatch {
            records: batch,
            next_iterator: Some(format!("{}:{}:{}", next, shard, stream)),
        })
    }
}

/// Decrements the running counter when a recorded run ends or is aborted.
struct RunGuard(Arc<AtomicUsize>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine that records every run configuration and idles until shutdown.
#[derive(Default)]
pub struct RecordingEngine {
    configs: Mutex<Vec<EngineConfig>>,
    processors: Mutex<Vec<Arc<dyn ShardRecordProcessor>>>,
    started: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    ignore_shutdown: AtomicBool,
    fail_scheduler: AtomicBool,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configurations of every scheduler built so far, oldest first.
    pub fn configs(&self) -> Vec<EngineConfig> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Processor handed to the most recent scheduler.
    pub fn last_processor(&self) -> Option<Arc<dyn ShardRecordProcessor>> {
        self.processors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }

    /// Runs that began executing.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Runs executing right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Make later runs ignore the shutdown signal.
    pub fn set_ignore_shutdown(&self, ignore: bool) {
        self.ignore_shutdown.store(ignore, Ordering::SeqCst);
    }

    /// Make later `scheduler` calls fail.
    pub fn set_fail_scheduler(&self, fail: bool) {
        self.fail_scheduler.store(fail, Ordering::SeqCst);
    }
}

impl ConsumptionEngine for RecordingEngine {
    fn scheduler(
        &self,
        config: EngineConfig,
        processor: Arc<dyn ShardRecordProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<EngineRun> {
        if self.fail_scheduler.load(Ordering::SeqCst) {
            return Err(BusError::Subscribe("Mock scheduler failure".to_string()));
        }

        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(config);
        self.processors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(processor);

        let started = self.started.clone();
        let running = self.running.clone();
        let ignore_shutdown = self.ignore_shutdown.load(Ordering::SeqCst);

        Ok(Box::pin(async move {
            started.fetch_add(1, Ordering::SeqCst);
            running.fetch_add(1, Ordering::SeqCst);
            let _guard = RunGuard(running);

            if ignore_shutdown {
                futures::future::pending::<()>().await;
            }
            // Err means the sender is gone, which also stops the run.
            let _ = shutdown.wait_for(|stop| *stop).await;
            Ok(())
        }))
    }
}

/// Handler that keeps every event it receives.
#[derive(Clone, Default)]
pub struct CollectingHandler {
    received: Arc<tokio::sync::Mutex<Vec<EventMessage>>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn received(&self) -> Vec<EventMessage> {
        self.received.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.received.lock().await.len()
    }

    pub async fn clear(&self) {
        self.received.lock().await.clear();
    }

    /// Wait until at least `count` events arrived. False on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count().await >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl EventHandler for CollectingHandler {
    fn handle(&self, event: Arc<EventMessage>) -> BoxFuture<'static, Result<()>> {
        let received = self.received.clone();
        Box::pin(async move {
            received.lock().await.push((*event).clone());
            Ok(())
        })
    }
}
