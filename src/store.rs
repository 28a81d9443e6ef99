//! Concurrent windowed counter store: the single owner of all
//! per-(window, page) counts.
//!
//! The store is a two-level map `window start -> page -> counter`, guarded
//! by one `RwLock`. Increments on existing counters take the read lock and
//! bump an `AtomicU64`, so writers to different pages proceed without
//! contention; the write lock is held only to insert a brand-new counter or
//! to run an eviction sweep. Range reads are best-effort snapshots: a
//! concurrent increment may or may not be visible, but a count is never
//! torn or decreasing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::window::Window;

/// Per-window map from page key to its running counter.
type PageCounters = HashMap<String, Arc<AtomicU64>>;

/// Concurrent mapping from `(window, page)` to a running event count.
///
/// The store exclusively owns every counter. The aggregation pipeline is
/// the only writer ([`increment`](WindowStore::increment) and
/// [`evict_before`](WindowStore::evict_before)); the interactive query
/// layer reads through [`fetch_range`](WindowStore::fetch_range).
///
/// # Panics
///
/// All methods panic if the internal lock is poisoned (a writer panicked
/// while holding it). This is treated as an invariant violation.
pub struct WindowStore {
    /// Process-wide tumbling window size, used to re-derive a [`Window`]
    /// from a stored start instant.
    window_size_ms: i64,
    /// Outer key: window start instant, epoch milliseconds.
    windows: RwLock<HashMap<i64, PageCounters>>,
}

impl std::fmt::Debug for WindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowStore")
            .field("window_size_ms", &self.window_size_ms)
            .field("counters", &self.len())
            .finish()
    }
}

impl WindowStore {
    /// Create an empty store for the given tumbling window size.
    pub fn new(window_size: Duration) -> Self {
        Self {
            window_size_ms: window_size.as_millis() as i64,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide tumbling window size, milliseconds.
    pub fn window_size_ms(&self) -> i64 {
        self.window_size_ms
    }

    /// Atomically create-or-bump the counter for `(window, page)`.
    ///
    /// The fast path takes the read lock and bumps the existing atomic, so
    /// concurrent increments on unrelated pages never serialize on the map.
    /// Only the first event for a `(window, page)` pair takes the write
    /// lock, inserting the counter at 1 -- a zero-valued counter is never
    /// observable. Incrementing a window that was already evicted silently
    /// recreates a fresh counter; the pipeline's grace check prevents that
    /// in practice.
    ///
    /// # Arguments
    ///
    /// * `window` - The tumbling window the event was assigned to.
    /// * `page` - The aggregation key.
    ///
    /// # Returns
    ///
    /// The post-increment count. No updates are ever lost, regardless of
    /// interleaving.
    pub fn increment(&self, window: Window, page: &str) -> u64 {
        {
            let windows = self.windows.read().expect("window store lock poisoned");
            if let Some(counter) = windows.get(&window.start_ms).and_then(|pages| pages.get(page))
            {
                return counter.fetch_add(1, Ordering::Relaxed) + 1;
            }
        }

        // First event for this (window, page): insert under the write lock.
        // Another writer may have inserted between the lock handoff, so
        // re-check before creating.
        let mut windows = self.windows.write().expect("window store lock poisoned");
        let pages = windows.entry(window.start_ms).or_default();
        match pages.get(page) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed) + 1,
            None => {
                pages.insert(page.to_owned(), Arc::new(AtomicU64::new(1)));
                1
            }
        }
    }

    /// Snapshot every counter whose window overlaps `[from_ms, to_ms)`.
    ///
    /// Best-effort consistency: increments applied concurrently with the
    /// read may or may not be visible, but each returned count is a value
    /// the counter actually held. Results are sorted by window start and
    /// page for deterministic iteration.
    ///
    /// # Arguments
    ///
    /// * `page_filter` - When set, restrict results to this page key.
    /// * `from_ms` - Inclusive start of the query interval.
    /// * `to_ms` - Exclusive end of the query interval.
    pub fn fetch_range(
        &self,
        page_filter: Option<&str>,
        from_ms: i64,
        to_ms: i64,
    ) -> Vec<(Window, String, u64)> {
        let windows = self.windows.read().expect("window store lock poisoned");
        let mut entries: Vec<(Window, String, u64)> = windows
            .iter()
            .filter_map(|(&start_ms, pages)| {
                let window = Window {
                    start_ms,
                    size_ms: self.window_size_ms,
                };
                window.overlaps(from_ms, to_ms).then_some((window, pages))
            })
            .flat_map(|(window, pages)| {
                pages
                    .iter()
                    .filter(|(page, _)| page_filter.is_none_or(|f| f == page.as_str()))
                    .map(move |(page, counter)| {
                        (window, page.clone(), counter.load(Ordering::Relaxed))
                    })
            })
            .collect();
        entries.sort_unstable_by(|a, b| (a.0.start_ms, &a.1).cmp(&(b.0.start_ms, &b.1)));
        entries
    }

    /// Remove every counter whose window end is strictly before `cutoff_ms`.
    ///
    /// Windows are removed wholesale, so eviction is all-or-nothing per
    /// counter: a reader never observes a count reset to a smaller nonzero
    /// value. An increment racing the sweep either lands before the window
    /// is dropped (and vanishes with it) or recreates a fresh counter
    /// afterwards.
    ///
    /// # Returns
    ///
    /// The number of counters evicted, for observability.
    pub fn evict_before(&self, cutoff_ms: i64) -> usize {
        let mut windows = self.windows.write().expect("window store lock poisoned");
        let mut evicted = 0;
        windows.retain(|&start_ms, pages| {
            if start_ms + self.window_size_ms < cutoff_ms {
                evicted += pages.len();
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Number of live counters across all windows.
    pub fn len(&self) -> usize {
        let windows = self.windows.read().expect("window store lock poisoned");
        windows.values().map(HashMap::len).sum()
    }

    /// Whether the store holds no counters at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
