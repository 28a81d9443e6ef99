//! Live snapshot service: periodic fan-out of point-in-time count maps.
//!
//! A single background task polls the interactive query layer on a fixed
//! cadence and broadcasts each frame to all subscribers. Delivery is
//! drop-oldest: a slow subscriber loses frames it failed to keep up with
//! but never blocks the timer, other subscribers, or aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::event::now_ms;
use crate::query::InteractiveQuery;

/// Configuration for the live snapshot service.
///
/// The push cadence is independent of the tumbling window size: by
/// default one push per second over a 5-second read span.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use viewtally::SnapshotConfig;
///
/// let config = SnapshotConfig {
///     span: Duration::from_secs(10),
///     ..SnapshotConfig::default()
/// };
/// assert_eq!(config.push_interval, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// How often a frame is taken and pushed. Default: 1 second.
    pub push_interval: Duration,
    /// Trailing read span each frame covers. Default: 5 seconds.
    pub span: Duration,
    /// Frames buffered per subscriber before the oldest are dropped.
    /// Default: 8.
    pub buffer: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(1),
            span: Duration::from_secs(5),
            buffer: 8,
        }
    }
}

/// One immutable point-in-time snapshot pushed to subscribers.
///
/// Serializes to the single JSON object the streaming surface delivers:
/// the `counts` map is the `{"<page>": <count>, ...}` payload, one line
/// per push on a text transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFrame {
    /// When the frame was taken, epoch milliseconds.
    pub taken_at_ms: i64,
    /// Per-page counts over the configured trailing span.
    pub counts: BTreeMap<String, u64>,
}

impl SnapshotFrame {
    /// The frame's count map as one JSON object.
    ///
    /// Keys are in sorted order (the map is a `BTreeMap`), so output for
    /// a given state is deterministic.
    pub fn counts_json(&self) -> String {
        serde_json::to_string(&self.counts).expect("BTreeMap<String, u64> serializes infallibly")
    }
}

/// The periodic snapshot fan-out task.
pub struct SnapshotService;

impl SnapshotService {
    /// Spawn the snapshot loop and return its control handle.
    ///
    /// The loop runs until [`SnapshotHandle::shutdown`] is called. It
    /// keeps running with zero subscribers; frames taken then are simply
    /// discarded.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(query: InteractiveQuery, config: SnapshotConfig) -> SnapshotHandle {
        let (frames_tx, _) = broadcast::channel(config.buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_snapshot_loop(
            query,
            config,
            frames_tx.clone(),
            shutdown_rx,
        ));
        SnapshotHandle {
            frames: frames_tx,
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Handle for subscribing to and stopping the snapshot loop.
///
/// Dropping the handle does **not** stop the loop -- call
/// [`shutdown`](SnapshotHandle::shutdown). `Clone` is cheap: all fields
/// are shared.
#[derive(Clone)]
pub struct SnapshotHandle {
    /// Fan-out channel; each `subscribe` call gets an independent cursor.
    frames: broadcast::Sender<Arc<SnapshotFrame>>,
    /// Sends `true` to signal the loop to stop.
    shutdown_tx: watch::Sender<bool>,
    /// The spawned task, taken and awaited exactly once by `shutdown`.
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SnapshotHandle {
    /// Subscribe to the live frame stream.
    ///
    /// No historical backfill: the first frame a new subscriber sees is
    /// the next one taken after subscribing. Dropping the returned stream
    /// releases the subscription immediately.
    pub fn subscribe(&self) -> SnapshotStream {
        SnapshotStream {
            rx: self.frames.subscribe(),
        }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Signal the loop to stop and wait for it to finish.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            if let Err(e) = join_handle.await {
                tracing::error!(error = %e, "snapshot loop task panicked");
            }
        }
    }
}

/// A subscriber's view of the snapshot stream.
///
/// Lag is absorbed transparently: when the subscriber falls more than the
/// configured buffer behind, the oldest frames are dropped and the stream
/// resumes from the oldest retained one.
pub struct SnapshotStream {
    rx: broadcast::Receiver<Arc<SnapshotFrame>>,
}

impl SnapshotStream {
    /// Wait for the next frame.
    ///
    /// # Returns
    ///
    /// `None` once the snapshot loop has shut down and every
    /// [`SnapshotHandle`] has been dropped.
    pub async fn next(&mut self) -> Option<Arc<SnapshotFrame>> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "slow snapshot subscriber dropped frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The timer loop: take a frame each tick, broadcast, repeat.
async fn run_snapshot_loop(
    query: InteractiveQuery,
    config: SnapshotConfig,
    frames: broadcast::Sender<Arc<SnapshotFrame>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.push_interval);
    // The first tick completes immediately; consume it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = Arc::new(SnapshotFrame {
                    taken_at_ms: now_ms(),
                    counts: query.snapshot(config.span),
                });
                // Err means no subscribers right now; the frame is
                // discarded and the loop keeps its cadence.
                let _ = frames.send(frame);
            }
            // Resolves on a shutdown signal or when every sender is
            // gone; either way the loop is done.
            _ = shutdown_rx.changed() => {
                tracing::info!("snapshot loop shutting down");
                return;
            }
        }
    }
}
