//! Interactive query layer: read-only trailing-span reads over the store.
//!
//! A query is a *sliding* read over tumbling write-windows: "all data
//! younger than N seconds". When the span covers more than one tumbling
//! window, counts for the same page are summed across all of them
//! rather than returning only the live window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::event::now_ms;
use crate::store::WindowStore;

/// Read-only access path into the [`WindowStore`].
///
/// Never blocks writers beyond the store's own read lock. `Clone` is
/// cheap: the store is `Arc`-shared.
#[derive(Debug, Clone)]
pub struct InteractiveQuery {
    store: Arc<WindowStore>,
}

impl InteractiveQuery {
    /// Create a query layer over the given store.
    pub fn new(store: Arc<WindowStore>) -> Self {
        Self { store }
    }

    /// Per-page counts over the trailing `span`, ending now.
    ///
    /// See [`snapshot_at`](InteractiveQuery::snapshot_at).
    pub fn snapshot(&self, span: Duration) -> BTreeMap<String, u64> {
        self.snapshot_at(span, now_ms())
    }

    /// Per-page counts over `[now - span, now)` for an explicit instant.
    ///
    /// Fetches every counter whose window overlaps the interval and folds
    /// them by summing counts per page. Returns an empty map -- not an
    /// error -- when nothing is in range (e.g. at cold start).
    ///
    /// # Arguments
    ///
    /// * `span` - Trailing duration of the read interval.
    /// * `now_ms` - Exclusive end of the interval, epoch milliseconds.
    pub fn snapshot_at(&self, span: Duration, now_ms: i64) -> BTreeMap<String, u64> {
        let from_ms = now_ms - span.as_millis() as i64;
        let mut counts = BTreeMap::new();
        for (_, page, count) in self.store.fetch_range(None, from_ms, now_ms) {
            *counts.entry(page).or_insert(0) += count;
        }
        counts
    }
}
