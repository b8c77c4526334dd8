use super::*;
use crate::bus::mock::{CollectingHandler, MemoryStream, RecordingEngine};
use crate::bus::NoopBroker;
use crate::config::StartPosition;
use crate::event::Event;
use crate::storage::{InMemoryLeaseStore, TRIM_HORIZON};
use uuid::Uuid;

struct Harness {
    stream: MemoryStream,
    engine: Arc<RecordingEngine>,
    leases: Arc<InMemoryLeaseStore>,
    config: Arc<KinesisConfig>,
}

impl Harness {
    fn new(send_async: bool) -> Self {
        Self {
            stream: MemoryStream::new(),
            engine: Arc::new(RecordingEngine::new()),
            leases: Arc::new(InMemoryLeaseStore::new()),
            config: Arc::new(KinesisConfig {
                application_name: "app".to_string(),
                send_async,
                publish_timeout_ms: 1000,
                shutdown_timeout_ms: 1000,
                ..Default::default()
            }),
        }
    }

    async fn broker(&self, previous: Option<HashSet<TopicSubscriber>>) -> KinesisBroker {
        let parts = BrokerParts {
            transport: Arc::new(self.stream.clone()),
            engine: self.engine.clone(),
            leases: self.leases.clone(),
        };
        KinesisBroker::new(self.config.clone(), parts, previous).await
    }
}

fn handler() -> Arc<dyn EventHandler> {
    Arc::new(CollectingHandler::new())
}

#[tokio::test]
async fn test_send_uses_source_instance_as_partition_key() {
    let h = Harness::new(false);
    h.stream.create_stream("t1", 2).await;
    let broker = h.broker(None).await;
    let event = EventMessage::new(Uuid::new_v4(), Event::new("ref-updated"));

    assert!(broker.send("t1", &event).await);

    let records = h.stream.records("t1").await;
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].partition_key,
        event.header.source_instance_id.to_string()
    );
    assert_eq!(
        EventMessage::from_json_bytes(&records[0].data).unwrap(),
        event
    );
}

#[tokio::test]
async fn test_send_with_result_reports_attempts() {
    let h = Harness::new(false);
    h.stream.create_stream("t1", 1).await;
    let broker = h.broker(None).await;
    let event = EventMessage::new(Uuid::new_v4(), Event::new("x"));

    assert_eq!(
        broker.send_with_result("t1", &event).await,
        PublishResult::success(1)
    );
}

#[tokio::test]
async fn test_send_to_missing_stream_returns_false_in_sync_mode() {
    let h = Harness::new(false);
    let broker = h.broker(None).await;
    let event = EventMessage::new(Uuid::new_v4(), Event::new("x"));
    assert!(!broker.send("missing", &event).await);
}

#[tokio::test]
async fn test_send_to_missing_stream_returns_true_in_async_mode() {
    let h = Harness::new(true);
    let broker = h.broker(None).await;
    let event = EventMessage::new(Uuid::new_v4(), Event::new("x"));
    assert!(broker.send("missing", &event).await);
}

#[tokio::test]
async fn test_receive_async_is_additive() {
    let h = Harness::new(false);
    let broker = h.broker(None).await;
    let shared = handler();

    broker.receive_async("t1", shared.clone()).await;
    broker.receive_async("t1", shared.clone()).await;
    broker.receive_async("t2", handler()).await;

    assert_eq!(broker.consumers().await.len(), 3);
    assert_eq!(h.engine.configs().len(), 3);
    // Same pair registered twice collapses in the set view.
    assert_eq!(broker.topic_subscribers().await.len(), 2);
    broker.disconnect().await;
}

#[tokio::test]
async fn test_failed_subscribe_is_not_added() {
    let h = Harness::new(false);
    h.engine.set_fail_scheduler(true);
    let broker = h.broker(None).await;

    broker.receive_async("t1", handler()).await;

    assert!(broker.consumers().await.is_empty());
    assert!(broker.topic_subscribers().await.is_empty());
}

#[tokio::test]
async fn test_disconnect_stops_everything() {
    let h = Harness::new(false);
    let broker = h.broker(None).await;
    broker.receive_async("t1", handler()).await;
    broker.receive_async("t2", handler()).await;

    broker.disconnect().await;

    assert!(broker.topic_subscribers().await.is_empty());
    assert_eq!(h.engine.running(), 0);
}

#[tokio::test]
async fn test_subscribers_equal_after_disconnect_and_resubscribe() {
    let h = Harness::new(false);
    let broker = h.broker(None).await;
    let shared = handler();
    broker.receive_async("t1", shared.clone()).await;
    let before = broker.topic_subscribers().await;

    broker.disconnect().await;
    broker.receive_async("t1", shared).await;

    assert_eq!(broker.topic_subscribers().await, before);
    broker.disconnect().await;
}

#[tokio::test]
async fn test_replay_without_workers_is_noop() {
    let h = Harness::new(false);
    h.leases.put_lease("app-t1", "s0", "00000000000000000004").await;
    let broker = h.broker(None).await;

    broker.replay_all_events("t1").await;

    assert_eq!(h.leases.update_count().await, 0);
    assert_eq!(
        h.leases.leases("app-t1").await.unwrap()["s0"],
        "00000000000000000004"
    );
}

#[tokio::test]
async fn test_replay_resets_only_matching_topic() {
    let h = Harness::new(false);
    h.leases.put_lease("app-t1", "s0", "00000000000000000004").await;
    h.leases.put_lease("app-t2", "s0", "00000000000000000005").await;
    let broker = h.broker(None).await;
    broker.receive_async("t1", handler()).await;
    broker.receive_async("t2", handler()).await;

    broker.replay_all_events("t1").await;

    assert_eq!(h.leases.leases("app-t1").await.unwrap()["s0"], TRIM_HORIZON);
    assert_eq!(
        h.leases.leases("app-t2").await.unwrap()["s0"],
        "00000000000000000005"
    );
    let pending: Vec<(String, bool)> = broker
        .consumers()
        .await
        .iter()
        .map(|c| (c.topic().to_string(), c.reset_pending()))
        .collect();
    assert!(pending.contains(&("t1".to_string(), true)));
    assert!(pending.contains(&("t2".to_string(), false)));
    broker.disconnect().await;
}

#[tokio::test]
async fn test_replay_applies_to_next_subscribe() {
    let h = Harness::new(false);
    let broker = h.broker(None).await;
    broker.receive_async("t1", handler()).await;

    broker.replay_all_events("t1").await;
    let consumer = broker.consumers().await.remove(0);
    consumer.subscribe().await.unwrap();

    let positions: Vec<StartPosition> =
        h.engine.configs().iter().map(|c| c.initial_position).collect();
    assert_eq!(
        positions,
        vec![StartPosition::Latest, StartPosition::TrimHorizon]
    );
    broker.disconnect().await;
}

#[tokio::test]
async fn test_adopts_previous_broker_subscribers() {
    let h = Harness::new(false);
    let previous = NoopBroker::new();
    let first = handler();
    let second = handler();
    previous.receive_async("t1", first).await;
    previous.receive_async("t2", second).await;
    let snapshot = previous.topic_subscribers().await;

    let broker = h.broker(Some(snapshot.clone())).await;

    assert_eq!(broker.topic_subscribers().await, snapshot);
    assert_eq!(h.engine.configs().len(), 2);
    broker.disconnect().await;
}

#[tokio::test]
async fn test_handoff_between_kinesis_brokers() {
    let h = Harness::new(false);
    let old = h.broker(None).await;
    old.receive_async("t1", handler()).await;
    let snapshot = old.topic_subscribers().await;
    old.disconnect().await;

    let new = h.broker(Some(snapshot.clone())).await;

    assert_eq!(new.topic_subscribers().await, snapshot);
    new.disconnect().await;
}

#[tokio::test]
async fn test_no_predecessor_starts_empty() {
    let h = Harness::new(false);
    let broker = h.broker(None).await;
    assert!(broker.topic_subscribers().await.is_empty());
    assert!(h.engine.configs().is_empty());
}
