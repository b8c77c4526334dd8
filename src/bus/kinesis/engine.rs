//! Stream consumption engine.
//!
//! The engine owns shard leases and checkpoints. It hands every polled batch
//! to a [`ShardRecordProcessor`] and writes the checkpoint after the batch.
//!
//! [`PollingEngine`] is a single-worker engine: it takes every shard of the
//! stream, polls each one on a fixed interval and re-reads the stored
//! checkpoint before every poll, so a checkpoint reset from outside takes
//! effect on the next lease check. Runs sharing a lease table share one poll
//! loop and each of them receives every batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::transport::{IteratorPosition, ShardReader, StreamRecord};
use crate::bus::{BusError, Result};
use crate::config::{KinesisConfig, StartPosition};
use crate::storage::LeaseStore;
use crate::utils::retry;

/// Everything an engine needs to consume one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub stream_name: String,
    pub lease_table: String,
    pub worker_id: String,
    /// Used for shards that have no lease yet.
    pub initial_position: StartPosition,
    pub polling_interval: Duration,
    pub max_records: i32,
}

impl EngineConfig {
    /// Run configuration of `topic`. `from_beginning` overrides the
    /// configured initial position with `TrimHorizon`.
    pub fn for_topic(config: &KinesisConfig, topic: &str, from_beginning: bool) -> Self {
        Self {
            stream_name: topic.to_string(),
            lease_table: config.lease_table_name(topic),
            worker_id: config.worker_id(topic),
            initial_position: if from_beginning {
                StartPosition::TrimHorizon
            } else {
                config.initial_position
            },
            polling_interval: config.polling_interval(),
            max_records: config.max_records,
        }
    }
}

/// Callbacks the engine makes for each shard it owns.
#[async_trait]
pub trait ShardRecordProcessor: Send + Sync {
    async fn initialize(&self, shard_id: &str, checkpoint: &str);

    /// Process one batch. Returns the number of records handled successfully.
    ///
    /// `Err(BusError::Fatal)` stops the process.
    async fn process_records(&self, shard_id: &str, records: Vec<StreamRecord>) -> Result<usize>;

    async fn lease_lost(&self, shard_id: &str);

    async fn shard_ended(&self, shard_id: &str);

    async fn shutdown_requested(&self, shard_id: &str);
}

/// The future that runs an engine until shutdown.
pub type EngineRun = BoxFuture<'static, Result<()>>;

/// Builds engine runs.
pub trait ConsumptionEngine: Send + Sync {
    /// Assemble a run. Nothing happens until the returned future is polled.
    ///
    /// The run stops once `shutdown` turns true or its sender is dropped.
    fn scheduler(
        &self,
        config: EngineConfig,
        processor: Arc<dyn ShardRecordProcessor>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<EngineRun>;
}

/// Bounded pool running engine runs.
///
/// Each run holds a permit for its whole life, so runs beyond the pool size
/// wait until an earlier one stops.
#[derive(Clone)]
pub struct ConsumerExecutor {
    permits: Arc<Semaphore>,
}

impl ConsumerExecutor {
    pub fn new(pool_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    /// Run `run` once a permit is free. A run still queued when `shutdown`
    /// turns true (or its sender is dropped) exits without starting.
    pub fn spawn(
        &self,
        run: EngineRun,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<()>> {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit
                    .map_err(|_| BusError::Subscribe("Consumer executor is closed".to_string()))?,
                () = shutdown.wait_for(|stop| *stop).map(|_| ()) => {
                    debug!("Shutdown requested while queued for a consumer slot");
                    return Ok(());
                }
            };
            run.await
        })
    }

    /// Permits not held by a running engine.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Handle of a submitted engine run.
pub struct RunningEngine {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl RunningEngine {
    pub fn new(shutdown: watch::Sender<bool>, task: JoinHandle<Result<()>>) -> Self {
        Self { shutdown, task }
    }

    /// Signal shutdown and wait up to `timeout` for the run to finish.
    ///
    /// Returns true on a clean stop. A run still going after `timeout` is
    /// aborted.
    pub async fn request_graceful_shutdown(mut self, timeout: Duration) -> bool {
        // Fails only when the run already finished and dropped its receiver.
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Exception while executing graceful shutdown");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Engine task failed during graceful shutdown");
                false
            }
            Err(_) => {
                error!(
                    timeout = ?timeout,
                    "Timeout while waiting for shutdown. Scheduler may not have exited."
                );
                self.task.abort();
                false
            }
        }
    }
}

/// Log and stop the process. Called when a processor reports a fatal error.
fn halt(shard_id: &str, e: &BusError) -> ! {
    error!(
        shard_id = %shard_id,
        error = %e,
        "Unrecoverable failure while processing records, halting"
    );
    std::process::exit(1)
}

/// Single-worker polling engine over a [`ShardReader`] and a [`LeaseStore`].
///
/// Runs for the same lease table share one poll loop, and every batch goes
/// to each of their processors. Two subscriptions on one topic therefore
/// both see every record instead of racing each other for the checkpoint.
#[derive(Clone)]
pub struct PollingEngine {
    reader: Arc<dyn ShardReader>,
    leases: Arc<dyn LeaseStore>,
    loops: Arc<Mutex<HashMap<String, PollLoop>>>,
    next_member: Arc<AtomicU64>,
}

/// Poll loop of one lease table and the processors it feeds.
struct PollLoop {
    fanout: Arc<Fanout>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl PollingEngine {
    pub fn new(reader: Arc<dyn ShardReader>, leases: Arc<dyn LeaseStore>) -> Self {
        Self {
            reader,
            leases,
            loops: Arc::new(Mutex::new(HashMap::new())),
            next_member: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of poll loops currently running.
    pub async fn active_loops(&self) -> usize {
        self.loops.lock().await.len()
    }

    /// Register `processor` with the loop of `config.lease_table`, starting
    /// the loop when it is the first one.
    async fn join(
        &self,
        config: &EngineConfig,
        member: u64,
        processor: Arc<dyn ShardRecordProcessor>,
    ) {
        let mut loops = self.loops.lock().await;
        let running = loops
            .get(&config.lease_table)
            .map(|running| running.fanout.clone());
        let fanout = match running {
            Some(fanout) => {
                let members = fanout.len().await + 1;
                info!(
                    stream = %config.stream_name,
                    members = members,
                    "Joining running poll loop"
                );
                fanout
            }
            None => {
                let fanout = Arc::new(Fanout::default());
                let (stop, stop_rx) = watch::channel(false);
                let scheduler = Scheduler {
                    reader: self.reader.clone(),
                    leases: self.leases.clone(),
                    config: Arc::new(config.clone()),
                    fanout: fanout.clone(),
                    shutdown: stop_rx,
                };
                let task = tokio::spawn(scheduler.run());
                loops.insert(
                    config.lease_table.clone(),
                    PollLoop {
                        fanout: fanout.clone(),
                        stop,
                        task,
                    },
                );
                fanout
            }
        };
        fanout.join(member, processor).await;
    }

    /// Deregister a processor. The last one to leave stops the loop.
    async fn leave(
        &self,
        lease_table: &str,
        member: u64,
        processor: &Arc<dyn ShardRecordProcessor>,
    ) {
        let mut loops = self.loops.lock().await;
        let Some(fanout) = loops.get(lease_table).map(|running| running.fanout.clone()) else {
            return;
        };
        if fanout.leave(member, processor).await > 0 {
            return;
        }

        // Stopping under the lock keeps a new loop from overlapping the old one.
        if let Some(running) = loops.remove(lease_table) {
            // Fails only when the loop already finished.
            let _ = running.stop.send(true);
            match running.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Poll loop stopped with error"),
                Err(e) => warn!(error = %e, "Poll loop task failed"),
            }
        }
    }

    async fn member_run(
        self,
        config: EngineConfig,
        processor: Arc<dyn ShardRecordProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let member = self.next_member.fetch_add(1, Ordering::SeqCst);
        let mut membership = Membership {
            engine: self,
            lease_table: config.lease_table.clone(),
            member,
            processor: processor.clone(),
            active: true,
        };
        membership.engine.join(&config, member, processor).await;

        // A dropped sender counts as shutdown too.
        let _ = shutdown.wait_for(|stop| *stop).await;

        membership.close().await;
        Ok(())
    }
}

impl ConsumptionEngine for PollingEngine {
    fn scheduler(
        &self,
        config: EngineConfig,
        processor: Arc<dyn ShardRecordProcessor>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<EngineRun> {
        if config.stream_name.is_empty() {
            return Err(BusError::Subscribe("Stream name must not be empty".to_string()));
        }
        if config.max_records < 1 {
            return Err(BusError::Subscribe(format!(
                "max_records must be positive, got {}",
                config.max_records
            )));
        }

        Ok(Box::pin(self.clone().member_run(config, processor, shutdown)))
    }
}

/// Keeps a processor registered until its run ends.
///
/// A run aborted after a shutdown timeout never reaches `close`, so the drop
/// hands the deregistration to the runtime.
struct Membership {
    engine: PollingEngine,
    lease_table: String,
    member: u64,
    processor: Arc<dyn ShardRecordProcessor>,
    active: bool,
}

impl Membership {
    async fn close(&mut self) {
        self.active = false;
        self.engine
            .leave(&self.lease_table, self.member, &self.processor)
            .await;
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let engine = self.engine.clone();
            let lease_table = std::mem::take(&mut self.lease_table);
            let member = self.member;
            let processor = self.processor.clone();
            runtime.spawn(async move {
                engine.leave(&lease_table, member, &processor).await;
            });
        }
    }
}

/// Processors fed by one poll loop, plus the shards it currently holds.
#[derive(Default)]
struct Fanout {
    members: RwLock<Vec<(u64, Arc<dyn ShardRecordProcessor>)>>,
    /// Shard id to last known checkpoint.
    shards: RwLock<BTreeMap<String, String>>,
}

impl Fanout {
    async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    async fn processors(&self) -> Vec<Arc<dyn ShardRecordProcessor>> {
        self.members
            .read()
            .await
            .iter()
            .map(|(_, processor)| processor.clone())
            .collect()
    }

    /// Add a member and replay `initialize` for shards already held.
    async fn join(&self, member: u64, processor: Arc<dyn ShardRecordProcessor>) {
        let shards = self.shards.read().await.clone();
        for (shard_id, checkpoint) in &shards {
            processor.initialize(shard_id, checkpoint).await;
        }
        self.members.write().await.push((member, processor));
    }

    /// Remove a member, telling it that its shards are shutting down.
    /// Returns the number of members left.
    async fn leave(&self, member: u64, processor: &Arc<dyn ShardRecordProcessor>) -> usize {
        let remaining = {
            let mut members = self.members.write().await;
            members.retain(|(id, _)| *id != member);
            members.len()
        };
        let shards: Vec<String> = self.shards.read().await.keys().cloned().collect();
        for shard_id in &shards {
            processor.shutdown_requested(shard_id).await;
        }
        remaining
    }

    async fn initialize(&self, shard_id: &str, checkpoint: &str) {
        self.checkpointed(shard_id, checkpoint).await;
        for processor in self.processors().await {
            processor.initialize(shard_id, checkpoint).await;
        }
    }

    async fn checkpointed(&self, shard_id: &str, checkpoint: &str) {
        self.shards
            .write()
            .await
            .insert(shard_id.to_string(), checkpoint.to_string());
    }

    /// Hand the batch to every member. Only a fatal error is returned.
    async fn process_records(&self, shard_id: &str, records: Vec<StreamRecord>) -> Result<usize> {
        let mut handled = 0;
        for processor in self.processors().await {
            match processor.process_records(shard_id, records.clone()).await {
                Ok(count) => handled += count,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Batch processing failed"),
            }
        }
        Ok(handled)
    }

    async fn lease_lost(&self, shard_id: &str) {
        self.shards.write().await.remove(shard_id);
        for processor in self.processors().await {
            processor.lease_lost(shard_id).await;
        }
    }

    async fn shard_ended(&self, shard_id: &str) {
        self.shards.write().await.remove(shard_id);
        for processor in self.processors().await {
            processor.shard_ended(shard_id).await;
        }
    }

    async fn shutdown_requested(&self, shard_id: &str) {
        self.shards.write().await.remove(shard_id);
        for processor in self.processors().await {
            processor.shutdown_requested(shard_id).await;
        }
    }
}

struct Scheduler {
    reader: Arc<dyn ShardReader>,
    leases: Arc<dyn LeaseStore>,
    config: Arc<EngineConfig>,
    fanout: Arc<Fanout>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    async fn run(mut self) -> Result<()> {
        let span = info_span!(
            "scheduler",
            stream = %self.config.stream_name,
            worker_id = %self.config.worker_id
        );

        async move {
            let Some(shards) = self.start().await else {
                info!("Scheduler stopped before start-up completed");
                return Ok(());
            };
            info!(
                shards = shards.len(),
                initial_position = %self.config.initial_position,
                "Scheduler started"
            );

            let mut workers = JoinSet::new();
            for shard_id in shards {
                let consumer = ShardConsumer {
                    reader: self.reader.clone(),
                    leases: self.leases.clone(),
                    config: self.config.clone(),
                    fanout: self.fanout.clone(),
                    shutdown: self.shutdown.clone(),
                    shard_id: shard_id.clone(),
                };
                workers.spawn(consumer.run().instrument(info_span!("shard", shard_id = %shard_id)));
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Shard consumer stopped with error"),
                    Err(e) => warn!(error = %e, "Shard consumer task failed"),
                }
            }

            info!("Scheduler stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Create the lease table and list shards, retrying until it works.
    /// `None` when shutdown arrived first.
    async fn start(&mut self) -> Option<Vec<String>> {
        let mut backoff = retry::polling_backoff().build();
        loop {
            if *self.shutdown.borrow() {
                return None;
            }

            let started = async {
                self.leases.ensure_table(&self.config.lease_table).await?;
                self.reader.list_shards(&self.config.stream_name).await
            }
            .await;

            let delay = match started {
                Ok(shards) => return Some(shards),
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(10));
                    warn!(error = %e, retry_in = ?delay, "Scheduler start-up failed");
                    delay
                }
            };

            tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

enum PollOutcome {
    Continue,
    ShardEnded,
    LeaseLost,
}

struct ShardConsumer {
    reader: Arc<dyn ShardReader>,
    leases: Arc<dyn LeaseStore>,
    config: Arc<EngineConfig>,
    fanout: Arc<Fanout>,
    shutdown: watch::Receiver<bool>,
    shard_id: String,
}

/// Position of one shard consumer.
struct Cursor {
    /// Last checkpoint this consumer read or wrote.
    checkpoint: String,
    iterator: String,
}

impl ShardConsumer {
    async fn run(mut self) -> Result<()> {
        let mut cursor = match self.acquire().await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut backoff = retry::polling_backoff().build();
        loop {
            if *self.shutdown.borrow() {
                self.fanout.shutdown_requested(&self.shard_id).await;
                return Ok(());
            }

            let shutdown_signalled = tokio::select! {
                _ = self.shutdown.changed() => true,
                _ = tokio::time::sleep(self.config.polling_interval) => false,
            };
            if shutdown_signalled {
                self.fanout.shutdown_requested(&self.shard_id).await;
                return Ok(());
            }

            match self.poll(&mut cursor).await {
                Ok(PollOutcome::Continue) => backoff = retry::polling_backoff().build(),
                Ok(PollOutcome::ShardEnded) => {
                    self.fanout.shard_ended(&self.shard_id).await;
                    return Ok(());
                }
                Ok(PollOutcome::LeaseLost) => {
                    self.fanout.lease_lost(&self.shard_id).await;
                    return Ok(());
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(10));
                    warn!(error = %e, retry_in = ?delay, "Failed polling shard");
                    tokio::select! {
                        _ = self.shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Iterators expire, so the retry starts from a fresh one.
                    match self.iterator_at(&cursor.checkpoint).await {
                        Ok(iterator) => cursor.iterator = iterator,
                        Err(e) => warn!(error = %e, "Failed to reopen shard iterator"),
                    }
                }
            }
        }
    }

    /// Take the shard lease, creating it at the initial position when absent.
    async fn acquire(&mut self) -> Result<Option<Cursor>> {
        let mut backoff = retry::polling_backoff().build();
        loop {
            if *self.shutdown.borrow() {
                return Ok(None);
            }

            match self.open_cursor().await {
                Ok(cursor) => {
                    self.fanout
                        .initialize(&self.shard_id, &cursor.checkpoint)
                        .await;
                    return Ok(Some(cursor));
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(10));
                    warn!(error = %e, retry_in = ?delay, "Failed to acquire shard lease");
                    tokio::select! {
                        _ = self.shutdown.changed() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn open_cursor(&self) -> Result<Cursor> {
        let table = &self.config.lease_table;
        let checkpoint = match self.leases.get_checkpoint(table, &self.shard_id).await? {
            Some(checkpoint) => checkpoint,
            None => {
                let initial = self.config.initial_position.as_sentinel();
                if self
                    .leases
                    .compare_and_set_checkpoint(table, &self.shard_id, None, initial)
                    .await?
                {
                    info!(checkpoint = %initial, "Created shard lease");
                    initial.to_string()
                } else {
                    self.leases
                        .get_checkpoint(table, &self.shard_id)
                        .await?
                        .unwrap_or_else(|| initial.to_string())
                }
            }
        };

        let iterator = self.iterator_at(&checkpoint).await?;
        Ok(Cursor {
            checkpoint,
            iterator,
        })
    }

    async fn iterator_at(&self, checkpoint: &str) -> Result<String> {
        self.reader
            .shard_iterator(
                &self.config.stream_name,
                &self.shard_id,
                &IteratorPosition::from_checkpoint(checkpoint),
            )
            .await
    }

    async fn reposition(&self, cursor: &mut Cursor, checkpoint: String) -> Result<()> {
        info!(
            previous = %cursor.checkpoint,
            checkpoint = %checkpoint,
            "Checkpoint changed outside this worker, repositioning"
        );
        cursor.iterator = self.iterator_at(&checkpoint).await?;
        self.fanout.checkpointed(&self.shard_id, &checkpoint).await;
        cursor.checkpoint = checkpoint;
        Ok(())
    }

    async fn poll(&self, cursor: &mut Cursor) -> Result<PollOutcome> {
        let table = &self.config.lease_table;

        // Lease check.
        match self.leases.get_checkpoint(table, &self.shard_id).await? {
            None => return Ok(PollOutcome::LeaseLost),
            Some(stored) if stored != cursor.checkpoint => {
                self.reposition(cursor, stored).await?;
                return Ok(PollOutcome::Continue);
            }
            Some(_) => {}
        }

        let batch = self
            .reader
            .get_records(&cursor.iterator, self.config.max_records)
            .await?;

        if let Some(last) = batch.records.last().map(|r| r.sequence_number.clone()) {
            let received = batch.records.len();
            match self
                .fanout
                .process_records(&self.shard_id, batch.records)
                .await
            {
                Ok(handled) => debug!(received, handled, "Processed batch"),
                Err(e) if e.is_fatal() => halt(&self.shard_id, &e),
                Err(e) => warn!(error = %e, "Batch processing failed"),
            }

            let written = self
                .leases
                .compare_and_set_checkpoint(table, &self.shard_id, Some(&cursor.checkpoint), &last)
                .await?;
            if !written {
                return match self.leases.get_checkpoint(table, &self.shard_id).await? {
                    Some(stored) => {
                        self.reposition(cursor, stored).await?;
                        Ok(PollOutcome::Continue)
                    }
                    None => Ok(PollOutcome::LeaseLost),
                };
            }
            self.fanout.checkpointed(&self.shard_id, &last).await;
            cursor.checkpoint = last;
        }

        match batch.next_iterator {
            Some(next) => {
                cursor.iterator = next;
                Ok(PollOutcome::Continue)
            }
            None => Ok(PollOutcome::ShardEnded),
        }
    }
}
