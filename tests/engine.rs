//! End-to-end scenarios through the assembled engine: bus in, pipeline,
//! store, query layer, sink and snapshot stream out.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;
use viewtally::{CountUpdate, Engine, PageEvent, now_ms};

fn event(page: &str, timestamp_ms: i64, duration_ms: i64) -> PageEvent {
    PageEvent {
        event_id: Uuid::new_v4(),
        page: page.to_owned(),
        user: "U1".to_owned(),
        timestamp_ms,
        duration_ms,
    }
}

/// Poll `check` until it passes or a generous deadline expires.
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn below_threshold_event_is_never_counted() {
    let engine = Engine::builder().start().expect("engine");
    let now = now_ms();

    assert!(engine.ingest(event("P1", now, 5_000)));
    assert!(engine.ingest(event("P1", now, 50)));

    wait_until("both events processed", || {
        let m = engine.metrics();
        m.admitted + m.filtered == 2
    })
    .await;

    let counts = engine.query().snapshot(Duration::from_secs(5));
    assert_eq!(counts.get("P1"), Some(&1), "only the 5-second view counts");
    assert_eq!(engine.metrics().filtered, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn window_totals_reach_both_the_sink_and_the_snapshot() {
    let engine = Engine::builder().start().expect("engine");
    let mut updates = engine.take_count_updates().expect("default sink");
    let now = now_ms();

    for _ in 0..15 {
        assert!(engine.ingest(event("P1", now, 500)));
    }
    for _ in 0..23 {
        assert!(engine.ingest(event("P2", now, 500)));
    }

    wait_until("all 38 events admitted", || engine.metrics().admitted == 38).await;

    // The query layer agrees with the final totals.
    let counts = engine.query().snapshot(Duration::from_secs(5));
    assert_eq!(counts.get("P1"), Some(&15));
    assert_eq!(counts.get("P2"), Some(&23));

    // The sink saw every running total, per page in increasing order,
    // ending at the final pair.
    let mut seen: HashMap<String, Vec<u64>> = HashMap::new();
    while let Ok(CountUpdate { page, count }) = updates.try_recv() {
        seen.entry(page).or_default().push(count);
    }
    let p1 = &seen["P1"];
    let p2 = &seen["P2"];
    assert_eq!(p1.as_slice(), (1..=15).collect::<Vec<u64>>().as_slice());
    assert_eq!(p2.as_slice(), (1..=23).collect::<Vec<u64>>().as_slice());

    engine.shutdown().await;
}

#[tokio::test]
async fn late_event_does_not_resurrect_an_evicted_window() {
    let engine = Engine::builder()
        .grace_period(Duration::from_secs(5))
        .retention(Duration::from_secs(60))
        .start()
        .expect("engine");

    // Timestamp far enough in the past that its window closed more than
    // a grace period (plus a millisecond) before now.
    let stale = now_ms() - 3_600_000;
    assert!(engine.ingest(event("P1", stale, 5_000)));

    wait_until("late event accounted for", || engine.metrics().late == 1).await;
    assert!(
        engine.query().snapshot(Duration::from_secs(3_600 * 2)).is_empty(),
        "no stale window entry may appear"
    );
    assert_eq!(engine.metrics().admitted, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn snapshot_stream_reflects_ingested_counts() {
    let engine = Engine::builder()
        .push_interval(Duration::from_millis(50))
        .start()
        .expect("engine");
    let now = now_ms();

    for _ in 0..4 {
        engine.ingest(event("P1", now, 500));
    }
    wait_until("events admitted", || engine.metrics().admitted == 4).await;

    let mut frames = engine.subscribe();
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("frame within deadline")
        .expect("stream open");
    assert_eq!(frame.counts.get("P1"), Some(&4));
    assert_eq!(frame.counts_json(), r#"{"P1":4}"#);

    engine.shutdown().await;
}

#[tokio::test]
async fn manual_publish_feeds_the_pipeline_via_the_ingest_topic() {
    // Disable the duration filter so the random synthetic duration
    // cannot drop the published event.
    let engine = Engine::builder()
        .min_duration_ms(None)
        .start()
        .expect("engine");

    let event = engine.publish("P9", engine.ingest_topic());
    assert_eq!(event.page, "P9");

    wait_until("published event admitted", || engine.metrics().admitted == 1).await;
    let counts = engine.query().snapshot(Duration::from_secs(5));
    assert_eq!(counts.get("P9"), Some(&1));
    engine.shutdown().await;
}

#[tokio::test]
async fn raw_json_payloads_flow_end_to_end() {
    let engine = Engine::builder().start().expect("engine");
    let now = now_ms();

    let payload = format!(
        r#"{{"key":"P1","user":"U2","timestamp":{now},"durationMillis":800}}"#
    );
    assert!(engine.ingest_json(payload.as_bytes()));
    assert!(!engine.ingest_json(b"definitely not json"));

    wait_until("decoded event admitted", || engine.metrics().admitted == 1).await;
    assert_eq!(engine.metrics().malformed, 1);
    assert_eq!(
        engine.query().snapshot(Duration::from_secs(5)).get("P1"),
        Some(&1)
    );
    engine.shutdown().await;
}
