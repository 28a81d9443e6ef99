//! Windowed page-view aggregation with live streaming snapshots.
//!
//! Events are bucketed into fixed-size tumbling windows per page key;
//! running counts are emitted downstream on every update and served to
//! streaming subscribers as one point-in-time snapshot per second.

mod bus;
pub use bus::{CountSink, CountUpdate, DEFAULT_TOPIC_CAPACITY, EventBus, TopicSink};
mod engine;
pub use engine::{DEFAULT_INGEST_TOPIC, Engine, EngineBuilder};
mod error;
pub use error::{ConfigError, DecodeError, ServeError};
mod event;
pub use event::{PageEvent, decode_event, now_ms};
mod generator;
pub use generator::{GeneratorConfig, GeneratorHandle, spawn_generator};
mod live;
pub use live::{SnapshotConfig, SnapshotFrame, SnapshotHandle, SnapshotService, SnapshotStream};
mod pipeline;
pub use pipeline::{Aggregator, MetricsSnapshot, PipelineConfig, PipelineMetrics};
mod query;
pub use query::InteractiveQuery;
mod server;
pub use server::{TallyService, serve, serve_with_shutdown};
mod store;
pub use store::WindowStore;
mod window;
pub use window::Window;

/// Generated gRPC messages and service stubs.
pub mod proto {
    tonic::include_proto!("viewtally");
}
