//! kinesis-events-relay: logs every event of a topic
//!
//! Subscribes to the configured topic and prints each received event through
//! tracing. Useful for watching a stream and for checking credentials,
//! region and endpoint settings.
//!
//! ## Architecture
//! ```text
//! [Kinesis stream {topic}] --> [kinesis-events-relay] --> stdout
//!            ^                          |
//!            |                          v
//!            +------ [DynamoDB lease table {application_name}-{topic}]
//! ```
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - KINESIS_EVENTS_CONFIG: path to a YAML config file (optional)
//! - KINESIS_EVENTS__*: overrides for single keys, e.g. KINESIS_EVENTS__TOPIC
//! - KINESIS_EVENTS_LOG: tracing filter (default: info)
//! - KINESIS_EVENTS_REPLAY: when set, replay the topic from its oldest record

use std::sync::Arc;

use tracing::info;

use kinesis_events::bus::handler_fn;
use kinesis_events::utils::bootstrap::init_tracing;
use kinesis_events::{BrokerApi, EventMessage, KinesisBroker, KinesisConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = Arc::new(KinesisConfig::load(config_path.as_deref())?);

    init_tracing(config.aws_lib_log_level());
    config.log_summary();

    let broker = KinesisBroker::connect(config.clone(), None).await;

    let handler = handler_fn(|event: Arc<EventMessage>| async move {
        info!(
            event_id = %event.header.event_id,
            source_instance_id = %event.header.source_instance_id,
            event_type = %event.body.event_type,
            event_created_on = event.body.event_created_on,
            "Received event"
        );
        Ok(())
    });
    broker.receive_async(&config.topic, handler).await;

    if std::env::var("KINESIS_EVENTS_REPLAY").is_ok() {
        broker.replay_all_events(&config.topic).await;
    }

    info!(topic = %config.topic, "kinesis-events-relay started");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    broker.disconnect().await;
    Ok(())
}
