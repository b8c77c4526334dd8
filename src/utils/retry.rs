//! Backoff policies.
//!
//! Uses `backon` for exponential backoff with jitter. Builders are turned into
//! delay iterators with `BackoffBuilder::build` by the loops that own the
//! retry deadline.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between put-record attempts.
///
/// - Min delay: 100ms
/// - Max delay: 2s
/// - Max attempts: 100 (the record time-to-live usually ends retries first)
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(100)
        .with_jitter()
}

/// Backoff after failed shard polls and engine start-up errors.
///
/// - Min delay: 200ms
/// - Max delay: 10s
/// - Unbounded attempts
/// - Jitter enabled
pub fn polling_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(usize::MAX)
        .with_jitter()
}
