//! Event bus bridge for async delivery over sharded streams.
//!
//! This module contains:
//! - `BrokerApi` trait: the host-facing publish/subscribe seam
//! - `EventHandler` trait: For processing received events
//! - `PublishResult`: outcome of one publish call
//! - Implementations: Kinesis, Noop, plus in-memory collaborators in `mock`

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::event::EventMessage;

// Implementation modules
pub mod dispatch;
pub mod kinesis;
pub mod mock;
pub mod noop;

// Re-exports
pub use dispatch::{DispatchResult, RecordDispatcher};
pub use kinesis::{BrokerParts, KinesisBroker, KinesisConsumer, KinesisPublisher};
pub use noop::NoopBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lease store error: {0}")]
    LeaseStore(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler failed: {0}")]
    Handler(String),

    /// Unrecoverable failure while processing records. The consumption
    /// engine halts the process when a processor returns this.
    #[error("Unrecoverable failure: {0}")]
    Fatal(String),
}

impl BusError {
    /// Returns true if the process must not keep consuming after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Handler for processing events received from a topic.
pub trait EventHandler: Send + Sync {
    /// Process one decoded event.
    fn handle(&self, event: Arc<EventMessage>)
        -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: Arc<EventMessage>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(event))
    }
}

/// Wrap an async closure as a shareable handler.
///
/// Every call returns a new handler identity, so two calls with the same
/// closure register two distinct subscribers.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<EventMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Result of publishing one event to a stream.
///
/// `attempts == 0` means the publish failed before the transport
/// acknowledged anything (submission error, execution error or timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    success: bool,
    attempts: u32,
}

impl PublishResult {
    pub fn success(attempts: u32) -> Self {
        Self {
            success: true,
            attempts,
        }
    }

    pub fn failure(attempts: u32) -> Self {
        Self {
            success: false,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// A `(topic, handler)` pair registered through [`BrokerApi::receive_async`].
///
/// Equality and hashing use the topic plus handler identity (the `Arc`
/// allocation), never handler contents.
#[derive(Clone)]
pub struct TopicSubscriber {
    topic: String,
    handler: Arc<dyn EventHandler>,
}

impl TopicSubscriber {
    pub fn new(topic: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            topic: topic.into(),
            handler,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    fn handler_addr(&self) -> *const () {
        Arc::as_ptr(&self.handler) as *const ()
    }
}

impl PartialEq for TopicSubscriber {
    fn eq(&self, other: &Self) -> bool {
        self.topic == other.topic && self.handler_addr() == other.handler_addr()
    }
}

impl Eq for TopicSubscriber {}

impl Hash for TopicSubscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.topic.hash(state);
        self.handler_addr().hash(state);
    }
}

impl fmt::Debug for TopicSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscriber")
            .field("topic", &self.topic)
            .field("handler", &self.handler_addr())
            .finish()
    }
}

/// Host-facing publish/subscribe interface.
///
/// Implementations:
/// - `KinesisBroker`: Kinesis streams with DynamoDB lease tables
/// - `NoopBroker`: remembers subscriptions, delivers nothing
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Publish an event to a topic. Returns true when the publish succeeded.
    async fn send(&self, topic: &str, event: &EventMessage) -> bool;

    /// Publish an event and return the full outcome.
    async fn send_with_result(&self, topic: &str, event: &EventMessage) -> PublishResult;

    /// Start delivering events of `topic` to `handler`.
    ///
    /// Additive: registering the same pair twice creates two subscriptions.
    async fn receive_async(&self, topic: &str, handler: Arc<dyn EventHandler>);

    /// Snapshot of the active subscriptions.
    async fn topic_subscribers(&self) -> HashSet<TopicSubscriber>;

    /// Stop every subscription. Best-effort, never fails.
    async fn disconnect(&self);

    /// Rewind every subscription of `topic` to the earliest retained record.
    async fn replay_all_events(&self, topic: &str);
}

#[cfg(test)]
mod tests;
