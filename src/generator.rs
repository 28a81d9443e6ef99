//! Synthetic event supplier: random page-view events on a timer.
//!
//! External collaborator at its interface boundary -- the engine never
//! depends on it. Used by the `tallyd` demo binary and integration tests
//! to drive the pipeline with a steady trickle of random page views.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::event::PageEvent;

/// Configuration for the synthetic generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Gap between generated events. Default: 200 ms.
    pub interval: Duration,
    /// Topic the events are published to.
    pub topic: String,
    /// Pages drawn from uniformly at random. Default: `P1`, `P2`.
    pub pages: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            topic: "page-events".to_owned(),
            pages: vec!["P1".to_owned(), "P2".to_owned()],
        }
    }
}

/// Handle for stopping a running generator.
#[derive(Clone)]
pub struct GeneratorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl GeneratorHandle {
    /// Signal the generator to stop and wait for it. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            if let Err(e) = join_handle.await {
                tracing::error!(error = %e, "generator task panicked");
            }
        }
    }
}

/// Spawn the generator loop.
///
/// Each tick synthesizes one [`PageEvent`] for a uniformly random page
/// and publishes it to the configured topic. Drops (topic full or
/// unknown) are the bus's concern; the generator keeps its cadence.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime, or if `config.pages` is
/// empty.
pub fn spawn_generator(bus: Arc<EventBus>, config: GeneratorConfig) -> GeneratorHandle {
    assert!(!config.pages.is_empty(), "generator needs at least one page");
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let page = {
                        use rand::Rng;
                        let mut rng = rand::thread_rng();
                        config.pages[rng.gen_range(0..config.pages.len())].clone()
                    };
                    bus.publish(&config.topic, PageEvent::synthetic(page));
                }
                // Resolves on a shutdown signal or when every sender
                // is gone; either way the loop is done.
                _ = shutdown_rx.changed() => {
                    tracing::info!("generator shutting down");
                    return;
                }
            }
        }
    });
    GeneratorHandle {
        shutdown_tx,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn generator_publishes_configured_pages_to_its_topic() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.open_topic("gen", 64);

        let handle = spawn_generator(
            bus.clone(),
            GeneratorConfig {
                topic: "gen".to_owned(),
                ..GeneratorConfig::default()
            },
        );

        for _ in 0..5 {
            let event = rx.recv().await.expect("generated event");
            assert!(event.page == "P1" || event.page == "P2");
            assert!(event.duration_ms >= 10);
        }
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_stream() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.open_topic("gen", 64);

        let handle = spawn_generator(
            bus.clone(),
            GeneratorConfig {
                topic: "gen".to_owned(),
                ..GeneratorConfig::default()
            },
        );
        let _ = rx.recv().await.expect("at least one event");
        handle.shutdown().await;

        // Drain anything in flight; nothing further may arrive.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_the_handle_is_dropped_without_shutdown() {
        let bus = Arc::new(EventBus::new());
        let _rx = bus.open_topic("gen", 64);

        let handle = spawn_generator(
            bus,
            GeneratorConfig {
                topic: "gen".to_owned(),
                ..GeneratorConfig::default()
            },
        );
        let task = handle.task.lock().await.take().expect("task handle");

        // Dropping the handle drops the watch sender without ever
        // signalling shutdown; the loop must still end.
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should end once no shutdown sender remains")
            .expect("generator task");
    }
}
