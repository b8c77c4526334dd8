//! Bootstrap utilities for kinesis-events binaries.

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Tracing targets of the AWS SDK and its HTTP stack.
pub const AWS_LOG_TARGETS: &[&str] = &[
    "aws_config",
    "aws_credential_types",
    "aws_runtime",
    "aws_sigv4",
    "aws_smithy_runtime",
    "aws_smithy_runtime_api",
    "aws_sdk_kinesis",
    "aws_sdk_dynamodb",
    "aws_sdk_sts",
    "hyper",
    "hyper_util",
];

/// Filter directives pinning every AWS target to `level`.
pub fn aws_directives(level: Level) -> Vec<Directive> {
    let level = level.as_str().to_ascii_lowercase();
    AWS_LOG_TARGETS
        .iter()
        .filter_map(|target| format!("{}={}", target, level).parse().ok())
        .collect()
}

/// Initialize tracing with the KINESIS_EVENTS_LOG environment variable.
///
/// Defaults to "info" level if KINESIS_EVENTS_LOG is not set. AWS SDK crates
/// are pinned to `aws_lib_log_level` so their chatter stays out of the way.
pub fn init_tracing(aws_lib_log_level: Level) {
    let filter = aws_directives(aws_lib_log_level).into_iter().fold(
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")),
        |filter, directive| filter.add_directive(directive),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
