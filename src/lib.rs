//! kinesis-events - publish/subscribe bridge over Kinesis streams
//!
//! Lets a host publish events to named topics and receive them back as async
//! callbacks. Each topic is a Kinesis stream; consumption progress lives in a
//! DynamoDB lease table per topic, which the bridge can rewind to replay a
//! topic from its oldest retained record.

pub mod bus;
pub mod clients;
pub mod config;
pub mod event;
pub mod storage;
pub mod utils;

pub use bus::{BrokerApi, BusError, EventHandler, KinesisBroker, PublishResult, TopicSubscriber};
pub use config::KinesisConfig;
pub use event::{Event, EventHeader, EventMessage};
