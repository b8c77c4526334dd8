//! AWS SDK clients for Kinesis and DynamoDB.

use aws_config::{BehaviorVersion, SdkConfig};
use tracing::info;

use crate::config::KinesisConfig;

/// Load the shared SDK configuration, applying the configured region and
/// endpoint override on top of the default provider chain.
pub async fn load_sdk_config(config: &KinesisConfig) -> SdkConfig {
    let mut builder = aws_config::defaults(BehaviorVersion::latest());

    if let Some(ref region) = config.region {
        builder = builder.region(aws_config::Region::new(region.clone()));
    }

    if let Some(ref endpoint) = config.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    builder.load().await
}

/// Clients used by the bridge.
#[derive(Clone, Debug)]
pub struct AwsClients {
    pub kinesis: aws_sdk_kinesis::Client,
    pub dynamo: aws_sdk_dynamodb::Client,
}

impl AwsClients {
    pub async fn load(config: &KinesisConfig) -> Self {
        let sdk_config = load_sdk_config(config).await;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint,
            "Connected to AWS Kinesis/DynamoDB"
        );

        Self {
            kinesis: aws_sdk_kinesis::Client::new(&sdk_config),
            dynamo: aws_sdk_dynamodb::Client::new(&sdk_config),
        }
    }
}
