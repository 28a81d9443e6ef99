//! Composition root: explicit construction and wiring of the store,
//! pipeline, query layer, and snapshot service.
//!
//! No container resolves anything here -- [`EngineBuilder`] collects
//! configuration, [`start`](EngineBuilder::start) constructs the parts in
//! dependency order and spawns the two background tasks (ingest loop and
//! snapshot loop).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{CountSink, CountUpdate, DEFAULT_TOPIC_CAPACITY, EventBus, TopicSink};
use crate::error::ConfigError;
use crate::event::{PageEvent, decode_event};
use crate::live::{SnapshotConfig, SnapshotHandle, SnapshotService, SnapshotStream};
use crate::pipeline::{Aggregator, MetricsSnapshot, PipelineConfig, PipelineMetrics};
use crate::query::InteractiveQuery;
use crate::store::WindowStore;

/// Default name of the topic the pipeline consumes.
pub const DEFAULT_INGEST_TOPIC: &str = "page-events";

/// Builder for configuring and starting an [`Engine`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use viewtally::Engine;
///
/// # async fn example() -> Result<(), viewtally::ConfigError> {
/// let engine = Engine::builder()
///     .window_size(Duration::from_secs(5))
///     .grace_period(Duration::from_secs(5))
///     .retention(Duration::from_secs(60))
///     .start()?;
/// let counts = engine.query().snapshot(Duration::from_secs(5));
/// # let _ = counts;
/// # Ok(())
/// # }
/// ```
pub struct EngineBuilder {
    pipeline: PipelineConfig,
    snapshot: SnapshotConfig,
    sink: Option<Arc<dyn CountSink>>,
    ingest_topic: String,
    topic_capacity: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            snapshot: SnapshotConfig::default(),
            sink: None,
            ingest_topic: DEFAULT_INGEST_TOPIC.to_owned(),
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
        }
    }

    /// Set the tumbling window size. Default: 5 seconds.
    pub fn window_size(mut self, size: Duration) -> Self {
        self.pipeline.window_size = size;
        self
    }

    /// Set the out-of-order grace period. Default: 5 seconds.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.pipeline.grace_period = grace;
        self
    }

    /// Set the eviction retention. Must be at least the grace period.
    /// Default: 60 seconds.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.pipeline.retention = retention;
        self
    }

    /// Set (or disable, with `None`) the admission duration threshold.
    /// Default: `Some(100)`.
    pub fn min_duration_ms(mut self, threshold: Option<i64>) -> Self {
        self.pipeline.min_duration_ms = threshold;
        self
    }

    /// Set how often expired windows are swept. Default: 10 seconds.
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.pipeline.eviction_interval = interval;
        self
    }

    /// Set the snapshot push cadence. Default: 1 second.
    pub fn push_interval(mut self, interval: Duration) -> Self {
        self.snapshot.push_interval = interval;
        self
    }

    /// Set the trailing span each snapshot covers. Default: 5 seconds.
    pub fn snapshot_span(mut self, span: Duration) -> Self {
        self.snapshot.span = span;
        self
    }

    /// Replace the default downstream sink.
    ///
    /// When not set, the engine creates a [`TopicSink`] whose receiver is
    /// available once through [`Engine::take_count_updates`].
    pub fn sink(mut self, sink: Arc<dyn CountSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Rename the inbound topic the pipeline consumes.
    /// Default: `"page-events"`.
    pub fn ingest_topic(mut self, name: impl Into<String>) -> Self {
        self.ingest_topic = name.into();
        self
    }

    /// Set the inbound topic's bounded capacity. Default: 1024.
    pub fn topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = capacity;
        self
    }

    /// Construct the engine and spawn its background tasks.
    ///
    /// Wiring order: store, bus and ingest topic, sink, aggregator (which
    /// validates the configuration), then the ingest loop and the
    /// snapshot service.
    ///
    /// # Errors
    ///
    /// Propagates configuration validation failures.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime (two tasks are spawned).
    pub fn start(self) -> Result<Engine, ConfigError> {
        let store = Arc::new(WindowStore::new(self.pipeline.window_size));
        let bus = Arc::new(EventBus::new());
        let events = bus.open_topic(&self.ingest_topic, self.topic_capacity);

        let (sink, count_updates) = match self.sink {
            Some(sink) => (sink, None),
            None => {
                let (sink, rx) = TopicSink::new(DEFAULT_TOPIC_CAPACITY);
                (Arc::new(sink) as Arc<dyn CountSink>, Some(rx))
            }
        };

        let metrics = Arc::new(PipelineMetrics::default());
        let aggregator = Arc::new(Aggregator::new(
            store.clone(),
            sink,
            self.pipeline,
            metrics.clone(),
        )?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline_task = tokio::spawn(aggregator.clone().run(events, shutdown_rx));

        let query = InteractiveQuery::new(store.clone());
        let snapshots = SnapshotService::spawn(query.clone(), self.snapshot);

        tracing::info!(
            window_size_ms = store.window_size_ms(),
            ingest_topic = %self.ingest_topic,
            "engine started"
        );

        Ok(Engine {
            store,
            bus,
            query,
            snapshots,
            metrics,
            ingest_topic: self.ingest_topic,
            shutdown_tx,
            pipeline_task: Arc::new(tokio::sync::Mutex::new(Some(pipeline_task))),
            count_updates: Arc::new(std::sync::Mutex::new(count_updates)),
        })
    }
}

/// The running aggregation engine.
///
/// Owns the store, the bus, and the two background tasks. `Clone` is
/// cheap: all state is `Arc`-shared, so the engine can be handed to the
/// gRPC surface and to callers simultaneously.
#[derive(Clone)]
pub struct Engine {
    store: Arc<WindowStore>,
    bus: Arc<EventBus>,
    query: InteractiveQuery,
    snapshots: SnapshotHandle,
    metrics: Arc<PipelineMetrics>,
    ingest_topic: String,
    shutdown_tx: watch::Sender<bool>,
    pipeline_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
    count_updates: Arc<std::sync::Mutex<Option<mpsc::Receiver<CountUpdate>>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("ingest_topic", &self.ingest_topic)
            .finish()
    }
}

impl Engine {
    /// Start configuring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The in-memory bus carrying inbound event topics.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The read-only query layer.
    pub fn query(&self) -> &InteractiveQuery {
        &self.query
    }

    /// A copy of the current pipeline counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Subscribe to the live snapshot stream (one frame per second).
    pub fn subscribe(&self) -> SnapshotStream {
        self.snapshots.subscribe()
    }

    /// Push one decoded event onto the ingest topic.
    ///
    /// # Returns
    ///
    /// `false` if the topic was full and the event was dropped.
    pub fn ingest(&self, event: PageEvent) -> bool {
        self.bus.publish(&self.ingest_topic, event)
    }

    /// Decode a raw JSON payload and push it onto the ingest topic.
    ///
    /// Malformed payloads are counted in the pipeline metrics and
    /// dropped; the engine never fails on bad input.
    ///
    /// # Returns
    ///
    /// `true` if the payload decoded and was enqueued.
    pub fn ingest_json(&self, payload: &[u8]) -> bool {
        match decode_event(payload) {
            Ok(event) => self.ingest(event),
            Err(e) => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "dropped malformed inbound payload");
                false
            }
        }
    }

    /// Manual publish entry point: synthesize one event and forward it.
    ///
    /// Pure pass-through, not part of the aggregation core: the event is
    /// built exactly as the synthetic supplier would and sent to `topic`
    /// (which may or may not be the ingest topic).
    ///
    /// # Arguments
    ///
    /// * `page` - Page key to stamp on the event.
    /// * `topic` - Destination topic name.
    ///
    /// # Returns
    ///
    /// The synthesized event, whether or not the topic accepted it.
    pub fn publish(&self, page: &str, topic: &str) -> PageEvent {
        let event = PageEvent::synthetic(page);
        self.bus.publish(topic, event.clone());
        event
    }

    /// Name of the topic the pipeline consumes.
    pub fn ingest_topic(&self) -> &str {
        &self.ingest_topic
    }

    /// Take the default sink's receiving end.
    ///
    /// Available once, and only when no custom sink was configured.
    pub fn take_count_updates(&self) -> Option<mpsc::Receiver<CountUpdate>> {
        self.count_updates
            .lock()
            .expect("count updates lock poisoned")
            .take()
    }

    /// Stop the snapshot loop and the ingest loop, in that order.
    ///
    /// Idempotent. Aggregated state remains readable through
    /// [`query`](Engine::query) afterwards.
    pub async fn shutdown(&self) {
        self.snapshots.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        let task = self.pipeline_task.lock().await.take();
        if let Some(join_handle) = task {
            if let Err(e) = join_handle.await {
                tracing::error!(error = %e, "pipeline task panicked");
            }
        }
    }
}
