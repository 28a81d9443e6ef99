//! Page-view event wire type, decoding, and synthetic event construction.
//!
//! The wire shape is `{ "key": string, "user": string, "timestamp":
//! epoch-millis-or-RFC3339, "durationMillis": integer }`. Decoding is the
//! single place malformed input is detected; everything downstream works
//! with the validated [`PageEvent`].

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;

/// Current wall-clock instant as epoch milliseconds.
///
/// This is the watermark used for lateness and eviction decisions: a
/// wall-clock approximation rather than tracked event time, which is
/// sufficient under the bounded grace-period model.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A single immutable page-view event.
///
/// `page` is the aggregation key; `duration_ms` feeds the admission
/// predicate. The remaining fields are payload carried through untouched.
/// `event_id` is stamped locally (a fresh v4 UUID) and never travels on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEvent {
    /// Local event identity, assigned at creation or decode time.
    #[serde(skip, default = "Uuid::new_v4")]
    pub event_id: Uuid,
    /// Page (or category) identifier -- the aggregation key.
    #[serde(rename = "key")]
    pub page: String,
    /// User identifier. Payload only; not used for windowing.
    pub user: String,
    /// Event timestamp, epoch milliseconds. Accepts either an integer
    /// or an RFC 3339 string on the wire; always serializes as millis.
    #[serde(rename = "timestamp", deserialize_with = "deserialize_timestamp")]
    pub timestamp_ms: i64,
    /// View duration in milliseconds -- the admission predicate's input.
    #[serde(rename = "durationMillis")]
    pub duration_ms: i64,
}

/// Accept a timestamp as either epoch milliseconds or an RFC 3339 string.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Millis(ms) => Ok(ms),
        RawTimestamp::Text(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| serde::de::Error::custom(format!("unparseable timestamp {s:?}: {e}"))),
    }
}

impl PageEvent {
    /// Construct a synthetic event for the given page, timestamped now.
    ///
    /// User and duration are randomized: user `U1` or `U2`, duration
    /// `10 + [0, 10000)` milliseconds, so roughly 1% of synthetic events
    /// fall under the default admission threshold.
    ///
    /// # Arguments
    ///
    /// * `page` - Page key to stamp on the event.
    pub fn synthetic(page: impl Into<String>) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self {
            event_id: Uuid::new_v4(),
            page: page.into(),
            user: if rng.gen_bool(0.5) { "U1" } else { "U2" }.to_owned(),
            timestamp_ms: now_ms(),
            duration_ms: 10 + rng.gen_range(0..10_000),
        }
    }
}

/// Decode one wire event from a JSON payload.
///
/// # Arguments
///
/// * `payload` - Raw JSON bytes as received from the inbound topic.
///
/// # Returns
///
/// The validated [`PageEvent`] with a freshly stamped `event_id`.
///
/// # Errors
///
/// [`DecodeError::Json`] when the payload is not valid JSON or the
/// timestamp is unparseable; [`DecodeError::MissingPage`] when the `key`
/// field is absent or empty.
pub fn decode_event(payload: &[u8]) -> Result<PageEvent, DecodeError> {
    let event: PageEvent = serde_json::from_slice(payload)?;
    if event.page.is_empty() {
        return Err(DecodeError::MissingPage);
    }
    Ok(event)
}
