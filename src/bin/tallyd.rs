//! Demo daemon: synthetic events in, live analytics out.
//!
//! Wires the engine, the synthetic generator, a console printer for the
//! snapshot stream (one JSON object per line, once per second), and the
//! gRPC surface. Ctrl-C shuts everything down in order.

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use viewtally::{Engine, GeneratorConfig, spawn_generator};

const LISTEN_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let engine = Engine::builder()
        .window_size(Duration::from_secs(5))
        .snapshot_span(Duration::from_secs(5))
        .start()?;

    let generator = spawn_generator(engine.bus().clone(), GeneratorConfig::default());

    // Drain the downstream sink at debug level so it never fills up.
    if let Some(mut updates) = engine.take_count_updates() {
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                tracing::debug!(page = %update.page, count = update.count, "count update");
            }
        });
    }

    // Console dashboard: one JSON object per second on stdout.
    let mut frames = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            println!("{}", frame.counts_json());
        }
    });

    viewtally::serve_with_shutdown(engine.clone(), LISTEN_ADDR, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    generator.shutdown().await;
    engine.shutdown().await;
    printer.abort();

    let metrics = engine.metrics();
    tracing::info!(
        admitted = metrics.admitted,
        filtered = metrics.filtered,
        late = metrics.late,
        malformed = metrics.malformed,
        "final pipeline counters"
    );
    Ok(())
}
