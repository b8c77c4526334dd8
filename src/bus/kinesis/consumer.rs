//! Consumption worker: one subscription of one handler to one topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::checkpoint::CheckpointResetter;
use super::engine::{
    ConsumerExecutor, ConsumptionEngine, EngineConfig, RunningEngine, ShardRecordProcessor,
};
use crate::bus::{EventHandler, RecordDispatcher, Result};
use crate::config::KinesisConfig;

/// Shared collaborators every worker is built from.
#[derive(Clone)]
pub struct ConsumerFactory {
    config: Arc<KinesisConfig>,
    engine: Arc<dyn ConsumptionEngine>,
    executor: ConsumerExecutor,
    resetter: Arc<CheckpointResetter>,
}

impl ConsumerFactory {
    pub fn new(
        config: Arc<KinesisConfig>,
        engine: Arc<dyn ConsumptionEngine>,
        resetter: Arc<CheckpointResetter>,
    ) -> Self {
        let executor = ConsumerExecutor::new(config.number_of_subscribers);
        Self {
            config,
            engine,
            executor,
            resetter,
        }
    }

    pub fn create(&self, topic: &str, handler: Arc<dyn EventHandler>) -> KinesisConsumer {
        KinesisConsumer {
            topic: topic.to_string(),
            handler,
            config: self.config.clone(),
            engine: self.engine.clone(),
            executor: self.executor.clone(),
            resetter: self.resetter.clone(),
            reset_offset: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn executor(&self) -> &ConsumerExecutor {
        &self.executor
    }
}

/// Owns the engine run delivering `topic` to one handler.
///
/// At most one engine runs per worker. Lifecycle calls are serialized by
/// the `running` lock.
pub struct KinesisConsumer {
    topic: String,
    handler: Arc<dyn EventHandler>,
    config: Arc<KinesisConfig>,
    engine: Arc<dyn ConsumptionEngine>,
    executor: ConsumerExecutor,
    resetter: Arc<CheckpointResetter>,
    /// Armed by `reset_offset`, consumed by the next `subscribe`.
    reset_offset: AtomicBool,
    running: Mutex<Option<RunningEngine>>,
}

impl KinesisConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// True while a reset is waiting for the next subscribe.
    pub fn reset_pending(&self) -> bool {
        self.reset_offset.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start consuming, replacing any engine this worker already runs.
    ///
    /// Returns once the engine run was submitted to the consumer executor.
    pub async fn subscribe(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            info!(topic = %self.topic, "Stopping running scheduler before resubscribing");
            previous
                .request_graceful_shutdown(self.config.shutdown_timeout())
                .await;
        }

        let from_beginning = self.reset_offset.swap(false, Ordering::SeqCst);
        let engine_config = EngineConfig::for_topic(&self.config, &self.topic, from_beginning);
        info!(
            topic = %self.topic,
            worker_id = %engine_config.worker_id,
            initial_position = %engine_config.initial_position,
            "Kinesis consumer subscribing to stream"
        );

        let processor: Arc<dyn ShardRecordProcessor> =
            Arc::new(RecordDispatcher::new(&self.topic, self.handler.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queued = shutdown_rx.clone();

        let run = match self.engine.scheduler(engine_config, processor, shutdown_rx) {
            Ok(run) => run,
            Err(e) => {
                // The reset was not applied, keep it for the next attempt.
                if from_beginning {
                    self.reset_offset.store(true, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        let task = self.executor.spawn(run, queued);
        *running = Some(RunningEngine::new(shutdown_tx, task));
        Ok(())
    }

    /// Rewind every shard of the topic and make the next subscribe start
    /// from `TRIM_HORIZON`.
    pub async fn reset_offset(&self) {
        self.resetter.reset_all_shards(&self.topic).await;
        self.reset_offset.store(true, Ordering::SeqCst);
    }

    /// Stop the engine within the shutdown timeout. Never fails.
    pub async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        match running {
            Some(engine) => {
                let timeout = self.config.shutdown_timeout();
                info!(topic = %self.topic, timeout = ?timeout, "Waiting for scheduler shutdown");
                if engine.request_graceful_shutdown(timeout).await {
                    info!(topic = %self.topic, "Scheduler shut down");
                }
            }
            None => debug!(topic = %self.topic, "No scheduler running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{CollectingHandler, RecordingEngine};
    use crate::config::StartPosition;
    use crate::storage::{InMemoryLeaseStore, TRIM_HORIZON};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<RecordingEngine>,
        leases: Arc<InMemoryLeaseStore>,
        factory: ConsumerFactory,
    }

    fn fixture(config: KinesisConfig) -> Fixture {
        let engine = Arc::new(RecordingEngine::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let resetter = Arc::new(CheckpointResetter::new(
            config.application_name.clone(),
            leases.clone(),
        ));
        let factory = ConsumerFactory::new(Arc::new(config), engine.clone(), resetter);
        Fixture {
            engine,
            leases,
            factory,
        }
    }

    fn consumer(fixture: &Fixture, topic: &str) -> KinesisConsumer {
        fixture
            .factory
            .create(topic, Arc::new(CollectingHandler::new()))
    }

    async fn wait_running(engine: &RecordingEngine, expected: usize) {
        for _ in 0..100 {
            if engine.running() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.running(), expected);
    }

    #[tokio::test]
    async fn test_subscribe_uses_configured_position() {
        let f = fixture(KinesisConfig {
            application_name: "app".to_string(),
            ..Default::default()
        });
        let worker = consumer(&f, "t1");

        worker.subscribe().await.unwrap();

        let configs = f.engine.configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].initial_position, StartPosition::Latest);
        assert_eq!(configs[0].stream_name, "t1");
        assert_eq!(configs[0].lease_table, "app-t1");
        assert_eq!(configs[0].worker_id, "klc-worker-app-t1");
        assert!(worker.is_running().await);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_then_subscribe_starts_from_trim_horizon_once() {
        let f = fixture(KinesisConfig::default());
        let worker = consumer(&f, "t1");

        worker.reset_offset().await;
        assert!(worker.reset_pending());

        worker.subscribe().await.unwrap();
        assert!(!worker.reset_pending());
        worker.subscribe().await.unwrap();

        let positions: Vec<StartPosition> =
            f.engine.configs().iter().map(|c| c.initial_position).collect();
        assert_eq!(
            positions,
            vec![StartPosition::TrimHorizon, StartPosition::Latest]
        );
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_rewinds_leases_even_when_not_running() {
        let f = fixture(KinesisConfig {
            application_name: "app".to_string(),
            ..Default::default()
        });
        f.leases.put_lease("app-t1", "s0", "00000000000000000009").await;
        let worker = consumer(&f, "t1");

        worker.reset_offset().await;

        assert_eq!(f.leases.leases("app-t1").await.unwrap()["s0"], TRIM_HORIZON);
        assert!(worker.reset_pending());
        assert!(!worker.is_running().await);
    }

    #[tokio::test]
    async fn test_resubscribe_stops_previous_engine() {
        let f = fixture(KinesisConfig::default());
        let worker = consumer(&f, "t1");

        worker.subscribe().await.unwrap();
        wait_running(&f.engine, 1).await;
        worker.subscribe().await.unwrap();
        wait_running(&f.engine, 1).await;

        assert_eq!(f.engine.configs().len(), 2);
        worker.shutdown().await;
        wait_running(&f.engine, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_without_engine_is_noop() {
        let f = fixture(KinesisConfig::default());
        let worker = consumer(&f, "t1");
        worker.shutdown().await;
        assert!(!worker.is_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_aborts_stuck_engine() {
        let f = fixture(KinesisConfig {
            shutdown_timeout_ms: 50,
            ..Default::default()
        });
        f.engine.set_ignore_shutdown(true);
        let worker = consumer(&f, "t1");
        worker.subscribe().await.unwrap();
        wait_running(&f.engine, 1).await;

        let started = std::time::Instant::now();
        worker.shutdown().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!worker.is_running().await);
        wait_running(&f.engine, 0).await;
    }

    #[tokio::test]
    async fn test_failed_scheduler_keeps_reset_armed() {
        let f = fixture(KinesisConfig::default());
        let worker = consumer(&f, "t1");
        worker.reset_offset().await;
        f.engine.set_fail_scheduler(true);

        assert!(worker.subscribe().await.is_err());
        assert!(worker.reset_pending());
        assert!(!worker.is_running().await);

        f.engine.set_fail_scheduler(false);
        worker.subscribe().await.unwrap();
        assert_eq!(
            f.engine.configs()[0].initial_position,
            StartPosition::TrimHorizon
        );
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_executor_bounds_concurrent_engines() {
        let f = fixture(KinesisConfig {
            number_of_subscribers: 1,
            ..Default::default()
        });
        let first = consumer(&f, "t1");
        let second = consumer(&f, "t2");

        first.subscribe().await.unwrap();
        second.subscribe().await.unwrap();
        wait_running(&f.engine, 1).await;
        assert_eq!(f.engine.started(), 1);

        first.shutdown().await;
        wait_running(&f.engine, 1).await;
        assert_eq!(f.engine.started(), 2);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_of_queued_worker_returns_promptly() {
        let f = fixture(KinesisConfig {
            number_of_subscribers: 1,
            shutdown_timeout_ms: 5000,
            ..Default::default()
        });
        let first = consumer(&f, "t1");
        let queued = consumer(&f, "t2");
        first.subscribe().await.unwrap();
        queued.subscribe().await.unwrap();
        wait_running(&f.engine, 1).await;

        let started = std::time::Instant::now();
        queued.shutdown().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.engine.started(), 1);
        assert_eq!(f.factory.executor().available(), 0);
        first.shutdown().await;
        assert_eq!(f.engine.started(), 1);
    }

    #[tokio::test]
    async fn test_processor_delivers_to_worker_handler() {
        use crate::event::{Event, EventMessage};
        use crate::bus::kinesis::transport::StreamRecord;

        let f = fixture(KinesisConfig::default());
        let handler = CollectingHandler::new();
        let worker = f.factory.create("t1", Arc::new(handler.clone()));
        worker.subscribe().await.unwrap();

        let message = EventMessage::new(uuid::Uuid::new_v4(), Event::new("ref-updated"));
        let processor = f.engine.last_processor().unwrap();
        let handled = processor
            .process_records(
                "shardId-000000000000",
                vec![StreamRecord {
                    partition_key: "k".to_string(),
                    sequence_number: "1".to_string(),
                    data: message.to_json_bytes().unwrap().into(),
                }],
            )
            .await
            .unwrap();

        assert_eq!(handled, 1);
        assert_eq!(handler.received().await, vec![message]);
        worker.shutdown().await;
    }
}
