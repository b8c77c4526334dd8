//! Kinesis broker bridge.
//!
//! Each topic is a Kinesis stream of the same name. Consumption of a topic
//! is coordinated through the DynamoDB lease table
//! `{application_name}-{topic}`, one row per shard.
//!
//! `receive_async` creates a [`KinesisConsumer`] per `(topic, handler)` pair;
//! `send` goes through the [`KinesisPublisher`] keyed by the event's source
//! instance id.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{error, info};

use super::{BrokerApi, EventHandler, PublishResult, TopicSubscriber};
use crate::config::KinesisConfig;
use crate::event::EventMessage;
use crate::storage::LeaseStore;

#[cfg(feature = "kinesis")]
pub mod aws;
pub mod checkpoint;
pub mod consumer;
pub mod engine;
pub mod publisher;
pub mod transport;

#[cfg(feature = "kinesis")]
pub use aws::KinesisStreamClient;
pub use checkpoint::CheckpointResetter;
pub use consumer::{ConsumerFactory, KinesisConsumer};
pub use engine::{ConsumptionEngine, EngineConfig, PollingEngine, RunningEngine};
pub use publisher::KinesisPublisher;
pub use transport::{ShardReader, StreamTransport};

/// Stream and lease collaborators a broker is assembled from.
#[derive(Clone)]
pub struct BrokerParts {
    pub transport: Arc<dyn StreamTransport>,
    pub engine: Arc<dyn ConsumptionEngine>,
    pub leases: Arc<dyn LeaseStore>,
}

/// Publish/subscribe bridge over Kinesis streams.
pub struct KinesisBroker {
    publisher: Arc<KinesisPublisher>,
    consumers: ConsumerFactory,
    live: RwLock<Vec<Arc<KinesisConsumer>>>,
}

impl KinesisBroker {
    /// Assemble a broker and adopt the subscriptions of `previous`.
    ///
    /// Every predecessor subscriber is subscribed before this returns, so a
    /// replaced broker hands its subscriptions over without losing handler
    /// identity.
    pub async fn new(
        config: Arc<KinesisConfig>,
        parts: BrokerParts,
        previous: Option<HashSet<TopicSubscriber>>,
    ) -> Self {
        let publisher = Arc::new(KinesisPublisher::new(parts.transport, config.clone()));
        let resetter = Arc::new(CheckpointResetter::new(
            config.application_name.clone(),
            parts.leases,
        ));
        let consumers = ConsumerFactory::new(config, parts.engine, resetter);

        let broker = Self {
            publisher,
            consumers,
            live: RwLock::new(Vec::new()),
        };

        if let Some(previous) = previous {
            info!(subscribers = previous.len(), "Adopting subscribers of previous broker");
            for subscriber in previous {
                broker
                    .receive_async(subscriber.topic(), subscriber.handler().clone())
                    .await;
            }
        }
        broker
    }

    /// Broker backed by Kinesis and DynamoDB.
    #[cfg(feature = "kinesis")]
    pub async fn connect(
        config: Arc<KinesisConfig>,
        previous: Option<HashSet<TopicSubscriber>>,
    ) -> Self {
        let clients = crate::clients::aws::AwsClients::load(&config).await;
        let stream = Arc::new(KinesisStreamClient::new(
            clients.kinesis,
            config.publish_single_request_timeout(),
            config.publish_timeout(),
        ));
        let leases: Arc<dyn LeaseStore> =
            Arc::new(crate::storage::DynamoLeaseStore::new(clients.dynamo));
        let parts = BrokerParts {
            transport: stream.clone(),
            engine: Arc::new(PollingEngine::new(stream, leases.clone())),
            leases,
        };
        Self::new(config, parts, previous).await
    }

    pub fn publisher(&self) -> &Arc<KinesisPublisher> {
        &self.publisher
    }

    /// Snapshot of the live workers.
    pub async fn consumers(&self) -> Vec<Arc<KinesisConsumer>> {
        self.live.read().await.clone()
    }
}

#[async_trait]
impl BrokerApi for KinesisBroker {
    async fn send(&self, topic: &str, event: &EventMessage) -> bool {
        self.send_with_result(topic, event).await.is_success()
    }

    async fn send_with_result(&self, topic: &str, event: &EventMessage) -> PublishResult {
        match event.to_json_bytes() {
            Ok(payload) => {
                self.publisher
                    .publish(
                        topic,
                        Bytes::from(payload),
                        &event.header.source_instance_id.to_string(),
                    )
                    .await
            }
            Err(e) => {
                error!(topic = %topic, event_id = %event.header.event_id, error = %e, "Failed to serialize event");
                PublishResult::failure(0)
            }
        }
    }

    async fn receive_async(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        let consumer = Arc::new(self.consumers.create(topic, handler));
        match consumer.subscribe().await {
            Ok(()) => {
                self.live.write().await.push(consumer);
                info!(topic = %topic, "Subscribed to topic");
            }
            Err(e) => error!(topic = %topic, error = %e, "Failed to subscribe to topic"),
        }
    }

    async fn topic_subscribers(&self) -> HashSet<TopicSubscriber> {
        self.live
            .read()
            .await
            .iter()
            .map(|c| TopicSubscriber::new(c.topic(), c.handler().clone()))
            .collect()
    }

    async fn disconnect(&self) {
        let consumers: Vec<Arc<KinesisConsumer>> = self.live.write().await.drain(..).collect();
        info!(consumers = consumers.len(), "Disconnecting from Kinesis");
        join_all(consumers.iter().map(|c| c.shutdown())).await;
    }

    async fn replay_all_events(&self, topic: &str) {
        let matching: Vec<Arc<KinesisConsumer>> = self
            .live
            .read()
            .await
            .iter()
            .filter(|c| c.topic() == topic)
            .cloned()
            .collect();
        info!(topic = %topic, consumers = matching.len(), "Replaying all events");
        join_all(matching.iter().map(|c| c.reset_offset())).await;
    }
}

#[cfg(test)]
mod tests;
