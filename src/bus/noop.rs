//! Broker that delivers nothing.
//!
//! Stands in until a real broker is configured. It remembers every
//! subscription so the replacement can adopt them through
//! [`BrokerApi::topic_subscribers`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{BrokerApi, EventHandler, PublishResult, TopicSubscriber};
use crate::event::EventMessage;

#[derive(Default)]
pub struct NoopBroker {
    subscribers: RwLock<HashSet<TopicSubscriber>>,
}

impl NoopBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerApi for NoopBroker {
    async fn send(&self, topic: &str, event: &EventMessage) -> bool {
        self.send_with_result(topic, event).await.is_success()
    }

    async fn send_with_result(&self, topic: &str, event: &EventMessage) -> PublishResult {
        warn!(
            topic = %topic,
            event_id = %event.header.event_id,
            "No broker configured, dropping event"
        );
        PublishResult::failure(0)
    }

    async fn receive_async(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        debug!(topic = %topic, "Remembering subscription for the next broker");
        self.subscribers
            .write()
            .await
            .insert(TopicSubscriber::new(topic, handler));
    }

    async fn topic_subscribers(&self) -> HashSet<TopicSubscriber> {
        self.subscribers.read().await.clone()
    }

    async fn disconnect(&self) {
        self.subscribers.write().await.clear();
    }

    async fn replay_all_events(&self, topic: &str) {
        debug!(topic = %topic, "No broker configured, nothing to replay");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::CollectingHandler;
    use crate::event::Event;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_send_always_fails() {
        let broker = NoopBroker::new();
        let event = EventMessage::new(Uuid::new_v4(), Event::new("x"));
        assert!(!broker.send("t1", &event).await);
        assert_eq!(
            broker.send_with_result("t1", &event).await,
            PublishResult::failure(0)
        );
    }

    #[tokio::test]
    async fn test_remembers_subscriptions_until_disconnect() {
        let broker = NoopBroker::new();
        let handler: Arc<dyn EventHandler> = Arc::new(CollectingHandler::new());
        broker.receive_async("t1", handler.clone()).await;
        broker.receive_async("t2", handler.clone()).await;

        let subscribers = broker.topic_subscribers().await;
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.contains(&TopicSubscriber::new("t1", handler)));

        broker.disconnect().await;
        assert!(broker.topic_subscribers().await.is_empty());
    }
}
