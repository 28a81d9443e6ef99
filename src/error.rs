//! Crate-level error types for event decoding, configuration, and serving.

use std::time::Duration;

/// Error returned when decoding an inbound wire event fails.
///
/// Malformed input is never fatal to the pipeline: callers count the
/// failure as a metric and drop the payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload was not valid JSON, or a field had the wrong shape
    /// (including an unparseable `timestamp`).
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The `key` field was absent or empty.
    ///
    /// Events without a page key cannot be aggregated and are dropped
    /// at the boundary.
    #[error("event has a missing or empty page key")]
    MissingPage,
}

/// Error returned when pipeline configuration is internally inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The tumbling window size was under one millisecond.
    #[error("window size must be at least one millisecond")]
    ZeroWindowSize,

    /// Retention was shorter than the grace period.
    ///
    /// A window must stay queryable at least as long as it still accepts
    /// late events, otherwise an admissible late event could target an
    /// already-evicted window.
    #[error("retention {retention:?} must be at least the grace period {grace:?}")]
    RetentionShorterThanGrace {
        /// Configured eviction retention.
        retention: Duration,
        /// Configured out-of-order grace period.
        grace: Duration,
    },
}

/// Error returned when the gRPC surface fails to start or serve.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The listen address did not parse as a socket address.
    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    /// The tonic transport failed to bind or serve.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
