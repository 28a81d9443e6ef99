//! The aggregation pipeline: admission, lateness, apply, emit.
//!
//! Deliberately an explicit state machine rather than a chain of stream
//! operators, so the predicate order is visible and testable: admit
//! check first, then key extraction, then windowing -- the order
//! determines which events are ever counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::bus::CountSink;
use crate::error::{ConfigError, DecodeError};
use crate::event::{PageEvent, decode_event, now_ms};
use crate::store::WindowStore;
use crate::window::Window;

/// Configuration knobs for the aggregation pipeline.
///
/// Grace period and retention are independent, but retention must be at
/// least the grace period so a window is never evicted while it still
/// accepts late-but-admissible events --
/// [`validate`](PipelineConfig::validate) enforces this.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use viewtally::PipelineConfig;
///
/// let config = PipelineConfig {
///     min_duration_ms: None, // disable the admission predicate
///     ..PipelineConfig::default()
/// };
/// assert_eq!(config.window_size, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tumbling window size. Default: 5 seconds.
    pub window_size: Duration,
    /// Maximum allowed lateness for an event to still be admitted into
    /// its nominal window. Default: 5 seconds.
    pub grace_period: Duration,
    /// How long a closed window stays queryable before eviction.
    /// Must be >= `grace_period`. Default: 60 seconds.
    pub retention: Duration,
    /// Admission predicate: drop events with `duration_ms` at or below
    /// this threshold. `None` disables the filter entirely.
    /// Default: `Some(100)`.
    pub min_duration_ms: Option<i64>,
    /// How often the ingest loop sweeps expired windows. Default: 10 s.
    pub eviction_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            retention: Duration::from_secs(60),
            min_duration_ms: Some(100),
            eviction_interval: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroWindowSize`] for a window that is zero once
    /// truncated to whole milliseconds (the store's resolution);
    /// [`ConfigError::RetentionShorterThanGrace`] when retention would
    /// evict windows that still accept late events.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size.as_millis() == 0 {
            return Err(ConfigError::ZeroWindowSize);
        }
        if self.retention < self.grace_period {
            return Err(ConfigError::RetentionShorterThanGrace {
                retention: self.retention,
                grace: self.grace_period,
            });
        }
        Ok(())
    }
}

/// Atomic observability counters for the pipeline.
///
/// Every drop path increments exactly one counter; nothing here is ever
/// fatal. Read a coherent-enough view via
/// [`snapshot`](PipelineMetrics::snapshot).
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub(crate) admitted: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) late: AtomicU64,
    pub(crate) malformed: AtomicU64,
    pub(crate) emitted: AtomicU64,
    pub(crate) sink_dropped: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Events that passed admission and lateness checks and were counted.
    pub admitted: u64,
    /// Events dropped by the duration threshold.
    pub filtered: u64,
    /// Events dropped for arriving beyond the grace period.
    pub late: u64,
    /// Inbound payloads that failed to decode.
    pub malformed: u64,
    /// Count updates accepted by the downstream sink.
    pub emitted: u64,
    /// Count updates the sink rejected (buffer full).
    pub sink_dropped: u64,
}

impl PipelineMetrics {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
        }
    }
}

/// The aggregation pipeline: the store's only writer.
///
/// Holds the store, the downstream sink, the configuration, and the
/// metrics. [`process`](Aggregator::process) runs one event through the
/// state machine; [`run`](Aggregator::run) is the ingest loop that feeds
/// it from a topic and periodically sweeps expired windows.
pub struct Aggregator {
    store: Arc<WindowStore>,
    sink: Arc<dyn CountSink>,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("config", &self.config)
            .finish()
    }
}

impl Aggregator {
    /// Build an aggregator after validating the configuration.
    ///
    /// # Errors
    ///
    /// Propagates [`PipelineConfig::validate`] failures.
    pub fn new(
        store: Arc<WindowStore>,
        sink: Arc<dyn CountSink>,
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            sink,
            config,
            metrics,
        })
    }

    /// Run one event through the pipeline against the wall clock.
    ///
    /// See [`process_at`](Aggregator::process_at).
    pub fn process(&self, event: &PageEvent) -> Option<u64> {
        self.process_at(event, now_ms())
    }

    /// Run one event through the pipeline with an explicit watermark.
    ///
    /// State machine, in order:
    ///
    /// 1. **Admit**: drop when the duration threshold is configured and
    ///    `duration_ms` is at or below it.
    /// 2. **Key extraction**: the event's page field.
    /// 3. **Lateness**: drop when `now - window.end > grace_period`,
    ///    so an already-evicted window is never resurrected by a
    ///    straggler.
    /// 4. **Apply**: increment the `(window, page)` counter.
    /// 5. **Emit**: push the running total downstream on every update --
    ///    continuous emission, never batch-at-window-close.
    ///
    /// # Arguments
    ///
    /// * `event` - The decoded event.
    /// * `now_ms` - The watermark instant to judge lateness against.
    ///
    /// # Returns
    ///
    /// The post-increment count if the event was admitted, `None` if it
    /// was dropped (filtered or late).
    pub fn process_at(&self, event: &PageEvent, now_ms: i64) -> Option<u64> {
        if let Some(min) = self.config.min_duration_ms {
            if event.duration_ms <= min {
                self.metrics.filtered.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let page = event.page.as_str();
        let window = Window::containing(event.timestamp_ms, self.store.window_size_ms());
        let grace_ms = self.config.grace_period.as_millis() as i64;
        if now_ms - window.end_ms() > grace_ms {
            self.metrics.late.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                page,
                timestamp_ms = event.timestamp_ms,
                window_end_ms = window.end_ms(),
                "dropped late event"
            );
            return None;
        }

        let count = self.store.increment(window, page);
        self.metrics.admitted.fetch_add(1, Ordering::Relaxed);

        if self.sink.deliver(page, count) {
            self.metrics.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.sink_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(page, count, "sink full; dropped count update");
        }
        Some(count)
    }

    /// Decode a raw JSON payload and process it.
    ///
    /// Malformed payloads are counted and dropped, never propagated --
    /// nothing at the ingest boundary may crash the pipeline.
    ///
    /// # Returns
    ///
    /// The decode error for the caller's benefit (logging, tests); the
    /// pipeline itself has already accounted for it.
    pub fn process_json(&self, payload: &[u8]) -> Result<Option<u64>, DecodeError> {
        match decode_event(payload) {
            Ok(event) => Ok(self.process(&event)),
            Err(e) => {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "dropped malformed event");
                Err(e)
            }
        }
    }

    /// The pipeline's observability counters.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Ingest loop: consume events from a topic until shutdown.
    ///
    /// Selects over event receipt, a periodic eviction sweep
    /// (`evict_before(now - retention)`), and the shutdown signal. Ends
    /// when the topic closes or shutdown is signalled -- aggregation
    /// state stays readable either way.
    ///
    /// # Arguments
    ///
    /// * `events` - Consuming end of the inbound topic.
    /// * `shutdown` - Watch receiver; a signal, or the loss of every
    ///   sender, stops the loop.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PageEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let retention_ms = self.config.retention.as_millis() as i64;
        let mut sweep = tokio::time::interval(self.config.eviction_interval);
        // The first tick completes immediately; consume it.
        sweep.tick().await;

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        self.process(&event);
                    }
                    None => {
                        tracing::info!("inbound topic closed; pipeline exiting");
                        return;
                    }
                },
                _ = sweep.tick() => {
                    let cutoff = now_ms() - retention_ms;
                    let evicted = self.store.evict_before(cutoff);
                    if evicted > 0 {
                        tracing::debug!(evicted, cutoff, "evicted expired windows");
                    }
                }
                // Resolves on a shutdown signal or when every sender
                // is gone; either way the loop is done.
                _ = shutdown.changed() => {
                    tracing::info!("pipeline shutdown");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicSink;
    use uuid::Uuid;

    fn event(page: &str, timestamp_ms: i64, duration_ms: i64) -> PageEvent {
        PageEvent {
            event_id: Uuid::new_v4(),
            page: page.to_owned(),
            user: "U1".to_owned(),
            timestamp_ms,
            duration_ms,
        }
    }

    fn aggregator(config: PipelineConfig) -> (Aggregator, mpsc::Receiver<crate::bus::CountUpdate>) {
        let store = Arc::new(WindowStore::new(config.window_size));
        let (sink, rx) = TopicSink::new(256);
        let agg = Aggregator::new(
            store,
            Arc::new(sink),
            config,
            Arc::new(PipelineMetrics::default()),
        )
        .expect("valid config");
        (agg, rx)
    }

    #[test]
    fn below_threshold_events_are_filtered() {
        let (agg, _rx) = aggregator(PipelineConfig::default());

        // 5-second view is admitted, 50 ms view is filtered out.
        assert_eq!(agg.process_at(&event("P1", 0, 5_000), 0), Some(1));
        assert_eq!(agg.process_at(&event("P1", 0, 50), 0), None);

        let metrics = agg.metrics().snapshot();
        assert_eq!(metrics.admitted, 1);
        assert_eq!(metrics.filtered, 1);
    }

    #[test]
    fn threshold_is_inclusive_at_the_boundary() {
        let (agg, _rx) = aggregator(PipelineConfig::default());
        // duration <= threshold is dropped, so exactly 100 is filtered.
        assert_eq!(agg.process_at(&event("P1", 0, 100), 0), None);
        assert_eq!(agg.process_at(&event("P1", 0, 101), 0), Some(1));
    }

    #[test]
    fn disabled_predicate_admits_everything() {
        let config = PipelineConfig {
            min_duration_ms: None,
            ..PipelineConfig::default()
        };
        let (agg, _rx) = aggregator(config);
        assert_eq!(agg.process_at(&event("P1", 0, 1), 0), Some(1));
        assert_eq!(agg.metrics().snapshot().filtered, 0);
    }

    #[test]
    fn admission_check_runs_before_the_lateness_check() {
        let (agg, _rx) = aggregator(PipelineConfig::default());
        // Event is both below-threshold and very late; predicate order
        // says it must be counted as filtered, not late.
        assert_eq!(agg.process_at(&event("P1", 0, 10), 1_000_000), None);
        let metrics = agg.metrics().snapshot();
        assert_eq!(metrics.filtered, 1);
        assert_eq!(metrics.late, 0);
    }

    #[test]
    fn late_event_is_dropped_and_never_resurrects_a_window() {
        let (agg, _rx) = aggregator(PipelineConfig::default());

        // Window [0, 5000), grace 5 s: one millisecond past the deadline.
        let now = 5_000 + 5_000 + 1;
        assert_eq!(agg.process_at(&event("P1", 0, 5_000), now), None);

        let metrics = agg.metrics().snapshot();
        assert_eq!(metrics.late, 1);
        assert_eq!(metrics.admitted, 0);
        assert!(agg.store.is_empty(), "store must not gain a stale window");
    }

    #[test]
    fn event_exactly_at_the_grace_deadline_is_admitted() {
        let (agg, _rx) = aggregator(PipelineConfig::default());
        let now = 5_000 + 5_000; // now - window.end == grace, not beyond
        assert_eq!(agg.process_at(&event("P1", 0, 5_000), now), Some(1));
    }

    #[tokio::test]
    async fn every_admitted_event_emits_a_running_total() {
        let (agg, mut rx) = aggregator(PipelineConfig::default());
        for _ in 0..3 {
            agg.process_at(&event("P1", 0, 500), 0);
        }

        for expected in 1..=3u64 {
            let update = rx.recv().await.expect("update");
            assert_eq!(update.page, "P1");
            assert_eq!(update.count, expected, "continuous running totals");
        }
        assert_eq!(agg.metrics().snapshot().emitted, 3);
    }

    #[test]
    fn full_sink_drops_the_update_but_keeps_the_count() {
        let store = Arc::new(WindowStore::new(Duration::from_secs(5)));
        let (sink, _rx) = TopicSink::new(1);
        let agg = Aggregator::new(
            store.clone(),
            Arc::new(sink),
            PipelineConfig::default(),
            Arc::new(PipelineMetrics::default()),
        )
        .expect("valid config");

        assert_eq!(agg.process_at(&event("P1", 0, 500), 0), Some(1));
        assert_eq!(agg.process_at(&event("P1", 0, 500), 0), Some(2));

        let metrics = agg.metrics().snapshot();
        assert_eq!(metrics.emitted, 1);
        assert_eq!(metrics.sink_dropped, 1);
        // Aggregation state is never lost to a sink outage.
        assert_eq!(store.fetch_range(Some("P1"), 0, 5_000)[0].2, 2);
    }

    #[test]
    fn malformed_payloads_are_counted_not_fatal() {
        let (agg, _rx) = aggregator(PipelineConfig::default());
        assert!(agg.process_json(b"{broken").is_err());
        assert!(
            agg.process_json(br#"{"key":"","user":"U1","timestamp":0,"durationMillis":500}"#)
                .is_err()
        );
        assert_eq!(agg.metrics().snapshot().malformed, 2);
    }

    #[test]
    fn config_rejects_retention_shorter_than_grace() {
        let config = PipelineConfig {
            grace_period: Duration::from_secs(10),
            retention: Duration::from_secs(5),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetentionShorterThanGrace { .. })
        ));
    }

    #[test]
    fn config_rejects_zero_window() {
        let config = PipelineConfig {
            window_size: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWindowSize)));
    }

    #[test]
    fn config_rejects_window_shorter_than_a_millisecond() {
        // Would truncate to zero at the store's resolution and break
        // window assignment.
        let config = PipelineConfig {
            window_size: Duration::from_micros(500),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWindowSize)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_sweeps_expired_windows() {
        let config = PipelineConfig {
            retention: Duration::from_secs(5),
            eviction_interval: Duration::from_millis(100),
            ..PipelineConfig::default()
        };
        let store = Arc::new(WindowStore::new(config.window_size));
        let (sink, _updates) = TopicSink::new(16);
        let agg = Arc::new(
            Aggregator::new(
                store.clone(),
                Arc::new(sink),
                config,
                Arc::new(PipelineMetrics::default()),
            )
            .expect("valid config"),
        );

        // Plant a counter in a window that closed long before retention.
        let ancient = Window::containing(now_ms() - 3_600_000, store.window_size_ms());
        store.increment(ancient, "P1");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_events_tx, events_rx) = mpsc::channel(16);
        let task = tokio::spawn(agg.clone().run(events_rx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.is_empty(), "sweep should evict the expired window");

        shutdown_tx.send(true).expect("receiver alive");
        task.await.expect("pipeline task");
    }

    #[tokio::test]
    async fn run_loop_exits_when_topic_closes() {
        let (agg, _updates) = aggregator(PipelineConfig::default());
        let agg = Arc::new(agg);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(16);
        let task = tokio::spawn(agg.clone().run(events_rx, shutdown_rx));

        events_tx
            .send(event("P1", now_ms(), 500))
            .await
            .expect("channel open");
        drop(events_tx);
        task.await.expect("pipeline task");

        assert_eq!(agg.metrics().snapshot().admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_exits_when_the_shutdown_sender_is_dropped() {
        let (agg, _updates) = aggregator(PipelineConfig::default());
        let agg = Arc::new(agg);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_events_tx, events_rx) = mpsc::channel(16);
        let task = tokio::spawn(agg.run(events_rx, shutdown_rx));

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should end once no shutdown sender remains")
            .expect("pipeline task");
    }
}
