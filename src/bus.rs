//! In-memory topic abstraction standing in for the external message bus.
//!
//! Topics are bounded `mpsc` channels keyed by name. Publishing never
//! blocks: a full or unknown topic drops the message and counts the drop.
//! The downstream sink side of the boundary is the [`CountSink`] trait,
//! with [`TopicSink`] as the bounded, drop-on-overflow implementation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::event::PageEvent;

/// Default bounded capacity for newly opened topics.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// One `(page, count)` update emitted downstream.
///
/// Updates for the same page are delivered in increasing-count order:
/// the pipeline is the single producer and the sink channel is FIFO.
/// Ordering between different pages carries no guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountUpdate {
    /// The aggregation key.
    pub page: String,
    /// The post-increment running total for that page's current window.
    pub count: u64,
}

/// Destination for per-update counter emissions.
///
/// Delivery must not block aggregation: implementations either accept the
/// update immediately or reject it (returning `false`), in which case the
/// pipeline counts the drop and moves on. Aggregation state is never lost
/// to a slow sink -- only the notification is.
pub trait CountSink: Send + Sync + 'static {
    /// Offer one update to the sink.
    ///
    /// # Returns
    ///
    /// `true` if the update was accepted, `false` if it was dropped.
    fn deliver(&self, page: &str, count: u64) -> bool;
}

/// [`CountSink`] backed by a bounded `mpsc` channel.
///
/// `deliver` uses `try_send`: when the consumer lags far enough that the
/// channel fills, updates are dropped rather than stalling the pipeline.
/// A later update for the same page always carries a larger count, so a
/// dropped intermediate total is superseded, not lost.
#[derive(Clone)]
pub struct TopicSink {
    tx: mpsc::Sender<CountUpdate>,
}

impl TopicSink {
    /// Create a sink and the receiver draining it.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Bounded channel capacity; must be nonzero.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CountUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl CountSink for TopicSink {
    fn deliver(&self, page: &str, count: u64) -> bool {
        self.tx
            .try_send(CountUpdate {
                page: page.to_owned(),
                count,
            })
            .is_ok()
    }
}

/// Registry of named in-memory event topics.
///
/// Stands in for the external message bus at its interface boundary: the
/// generator and the manual publish entry point write to topics, the
/// aggregation pipeline consumes one. `Clone`-free by design -- share it
/// behind an `Arc`.
pub struct EventBus {
    topics: RwLock<HashMap<String, mpsc::Sender<PageEvent>>>,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.topics.read().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no topics.
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Open (or replace) a named topic and return its consuming end.
    ///
    /// Re-opening an existing name replaces the sender, closing the old
    /// receiver once in-flight messages drain.
    ///
    /// # Arguments
    ///
    /// * `name` - Topic name.
    /// * `capacity` - Bounded channel capacity; must be nonzero.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn open_topic(&self, name: &str, capacity: usize) -> mpsc::Receiver<PageEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut topics = self.topics.write().expect("event bus lock poisoned");
        topics.insert(name.to_owned(), tx);
        rx
    }

    /// Publish one event to a named topic without blocking.
    ///
    /// Unknown topics and full channels drop the event (counted, logged at
    /// `debug`). The bus applies no backpressure beyond its bounded
    /// capacity, matching the uncontrolled-rate inbound contract.
    ///
    /// # Returns
    ///
    /// `true` if the event was enqueued.
    pub fn publish(&self, topic: &str, event: PageEvent) -> bool {
        let delivered = {
            let topics = self.topics.read().expect("event bus lock poisoned");
            match topics.get(topic) {
                Some(tx) => tx.try_send(event).is_ok(),
                None => false,
            }
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(topic, "dropped event: topic unknown or full");
        }
        delivered
    }

    /// Total events dropped by [`publish`](EventBus::publish) so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
