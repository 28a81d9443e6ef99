//! Tumbling-window value type and timestamp-to-window assignment.
//!
//! Windows are fixed-size, non-overlapping, half-open intervals
//! `[start, end)` that tile the timeline with no gaps for a given size.
//! Assignment is pure arithmetic; no state is kept here.

use serde::{Deserialize, Serialize};

/// A single tumbling window, identified by its start instant.
///
/// The window size is a process-wide configuration constant, so two
/// windows of the same deployment are equal iff their `start_ms` values
/// are equal. Both fields participate in `Eq`/`Hash` anyway, which is
/// equivalent under that constraint and keeps the type self-describing:
/// a window read back from the store can be interpreted without any
/// external metadata.
///
/// # Examples
///
/// ```
/// use viewtally::Window;
///
/// let w = Window::containing(12_345, 5_000);
/// assert_eq!(w.start_ms, 10_000);
/// assert_eq!(w.end_ms(), 15_000);
/// assert!(w.contains(12_345));
/// assert!(!w.contains(15_000)); // half-open
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    /// Inclusive start of the window, epoch milliseconds.
    pub start_ms: i64,
    /// Window size in milliseconds. Process-wide constant.
    pub size_ms: i64,
}

impl Window {
    /// Assign a timestamp to the unique tumbling window that contains it.
    ///
    /// Deterministic floor division: `start = floor(ts / size) * size`.
    /// `div_euclid` keeps the floor semantics for negative timestamps,
    /// so every instant -- including pre-epoch ones -- belongs to exactly
    /// one window.
    ///
    /// # Arguments
    ///
    /// * `timestamp_ms` - Event timestamp, epoch milliseconds.
    /// * `size_ms` - Window size in milliseconds. Must be positive.
    ///
    /// # Returns
    ///
    /// The window whose half-open interval `[start, start + size)`
    /// contains `timestamp_ms`.
    pub fn containing(timestamp_ms: i64, size_ms: i64) -> Self {
        debug_assert!(size_ms > 0, "window size must be positive");
        Self {
            start_ms: timestamp_ms.div_euclid(size_ms) * size_ms,
            size_ms,
        }
    }

    /// Exclusive end of the window, epoch milliseconds.
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.size_ms
    }

    /// Whether `timestamp_ms` falls inside this window's `[start, end)`.
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms()
    }

    /// Whether this window overlaps the half-open interval `[from, to)`.
    ///
    /// Used by range reads to select windows intersecting a query span.
    pub fn overlaps(&self, from_ms: i64, to_ms: i64) -> bool {
        self.start_ms < to_ms && self.end_ms() > from_ms
    }
}
