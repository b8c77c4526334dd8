//! Bridge configuration.
//!
//! A single flat [`KinesisConfig`] resolved once at startup and shared by
//! `Arc` with every component. Loaded from YAML files and environment
//! variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, Level};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "kinesis-events.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KINESIS_EVENTS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KINESIS_EVENTS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KINESIS_EVENTS_LOG";

/// Errors raised while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: &'static str, message: String },
}

/// Where a consumer with no stored checkpoint starts reading a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartPosition {
    /// Only records published after the consumer started.
    #[default]
    Latest,
    /// The oldest record still retained by the stream.
    TrimHorizon,
}

impl StartPosition {
    /// The checkpoint sentinel stored in the lease table for this position.
    pub fn as_sentinel(&self) -> &'static str {
        match self {
            Self::Latest => "LATEST",
            Self::TrimHorizon => "TRIM_HORIZON",
        }
    }
}

impl FromStr for StartPosition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LATEST" => Ok(Self::Latest),
            "TRIM_HORIZON" => Ok(Self::TrimHorizon),
            other => Err(ConfigError::Invalid {
                key: "initial_position",
                message: format!("unknown start position '{}'", other),
            }),
        }
    }
}

impl TryFrom<String> for StartPosition {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StartPosition> for String {
    fn from(value: StartPosition) -> Self {
        value.as_sentinel().to_ascii_lowercase()
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sentinel())
    }
}

/// Name of the lease table coordinating consumption of `topic`.
pub fn lease_table_name(application_name: &str, topic: &str) -> String {
    format!("{}-{}", application_name, topic)
}

/// Identifier the consumption engine registers leases under.
pub fn worker_id(application_name: &str, topic: &str) -> String {
    format!("klc-worker-{}-{}", application_name, topic)
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KinesisConfig {
    /// Prefix of every lease table and worker id.
    pub application_name: String,
    /// Stream that `KinesisPublisher::on_event` publishes to.
    pub topic: String,
    /// Upper bound of concurrently running consumption engines.
    pub number_of_subscribers: usize,
    pub initial_position: StartPosition,
    pub polling_interval_ms: u64,
    pub max_records: i32,
    pub publish_single_request_timeout_ms: u64,
    /// Sync publish wait, also the record time-to-live of transport retries.
    pub publish_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub send_async: bool,
    pub region: Option<String>,
    /// Endpoint override (LocalStack and similar).
    pub endpoint: Option<String>,
    pub aws_lib_log_level: String,
}

impl Default for KinesisConfig {
    fn default() -> Self {
        Self {
            application_name: "kinesis-events".to_string(),
            topic: "gerrit".to_string(),
            number_of_subscribers: 6,
            initial_position: StartPosition::Latest,
            polling_interval_ms: 1000,
            max_records: 100,
            publish_single_request_timeout_ms: 6000,
            publish_timeout_ms: 6000,
            shutdown_timeout_ms: 20000,
            send_async: true,
            region: None,
            endpoint: None,
            aws_lib_log_level: "warn".to_string(),
        }
    }
}

impl KinesisConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `kinesis-events.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: KinesisConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "application_name",
                message: "must not be empty".to_string(),
            });
        }
        if self.number_of_subscribers == 0 {
            return Err(ConfigError::Invalid {
                key: "number_of_subscribers",
                message: "must be at least 1".to_string(),
            });
        }
        // GetRecords accepts at most 10000 records per call.
        if !(1..=10_000).contains(&self.max_records) {
            return Err(ConfigError::Invalid {
                key: "max_records",
                message: format!("{} is outside 1..=10000", self.max_records),
            });
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn publish_single_request_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_single_request_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn lease_table_name(&self, topic: &str) -> String {
        lease_table_name(&self.application_name, topic)
    }

    pub fn worker_id(&self, topic: &str) -> String {
        worker_id(&self.application_name, topic)
    }

    /// Level applied to the AWS SDK crates. Unknown values fall back to WARN.
    pub fn aws_lib_log_level(&self) -> Level {
        Level::from_str(self.aws_lib_log_level.trim()).unwrap_or(Level::WARN)
    }

    /// Log the resolved settings once at startup.
    pub fn log_summary(&self) {
        info!(
            application_name = %self.application_name,
            topic = %self.topic,
            number_of_subscribers = self.number_of_subscribers,
            initial_position = %self.initial_position,
            polling_interval_ms = self.polling_interval_ms,
            max_records = self.max_records,
            publish_single_request_timeout_ms = self.publish_single_request_timeout_ms,
            publish_timeout_ms = self.publish_timeout_ms,
            shutdown_timeout_ms = self.shutdown_timeout_ms,
            send_async = self.send_async,
            region = ?self.region,
            endpoint = ?self.endpoint,
            aws_lib_log_level = %self.aws_lib_log_level(),
            "Kinesis events bridge configured"
        );
    }
}
