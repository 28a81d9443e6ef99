//! gRPC surface: manual publish entry point and the live analytics stream.
//!
//! Thin adapter over the [`Engine`] -- all aggregation semantics live in
//! the core modules; this file only translates between proto messages and
//! engine types and bridges the snapshot stream onto a response stream.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::engine::Engine;
use crate::error::ServeError;
use crate::live::SnapshotFrame;
use crate::proto;
use crate::proto::view_tally_server::{ViewTally, ViewTallyServer};

/// The tonic service implementation wrapping an [`Engine`].
#[derive(Debug, Clone)]
pub struct TallyService {
    engine: Engine,
}

impl TallyService {
    /// Wrap an engine for serving.
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Convert a core snapshot frame into its proto message.
fn to_proto_frame(frame: &SnapshotFrame) -> proto::SnapshotFrame {
    proto::SnapshotFrame {
        taken_at_ms: frame.taken_at_ms,
        counts: frame
            .counts
            .iter()
            .map(|(page, count)| (page.clone(), *count))
            .collect(),
    }
}

#[tonic::async_trait]
impl ViewTally for TallyService {
    /// Synthesize one event for `page` and forward it to `topic`.
    ///
    /// An empty `topic` selects the engine's ingest topic, so a bare
    /// `Publish(page)` feeds the pipeline directly.
    async fn publish(
        &self,
        request: Request<proto::PublishRequest>,
    ) -> Result<Response<proto::PublishedEvent>, Status> {
        let req = request.into_inner();
        if req.page.is_empty() {
            return Err(Status::invalid_argument("page must not be empty"));
        }
        let topic = if req.topic.is_empty() {
            self.engine.ingest_topic()
        } else {
            req.topic.as_str()
        };

        let event = self.engine.publish(&req.page, topic);
        tracing::debug!(page = %event.page, topic, "manual publish");
        Ok(Response::new(proto::PublishedEvent {
            event_id: event.event_id.to_string(),
            page: event.page,
            user: event.user,
            timestamp_ms: event.timestamp_ms,
            duration_ms: event.duration_ms,
        }))
    }

    type AnalyticsStream = Pin<Box<dyn Stream<Item = Result<proto::SnapshotFrame, Status>> + Send>>;

    /// Long-lived stream of per-page count frames, one per second.
    ///
    /// A bridging task forwards frames from the engine's broadcast
    /// subscription into the response channel; it exits -- releasing the
    /// subscription -- as soon as the client disconnects or the snapshot
    /// service shuts down.
    async fn analytics(
        &self,
        _request: Request<proto::AnalyticsRequest>,
    ) -> Result<Response<Self::AnalyticsStream>, Status> {
        let mut frames = self.engine.subscribe();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                if tx.send(Ok(to_proto_frame(&frame))).await.is_err() {
                    // Client went away; drop the subscription.
                    tracing::debug!("analytics client disconnected");
                    return;
                }
            }
            // Snapshot service shut down; the stream ends cleanly.
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::AnalyticsStream
        ))
    }
}

/// Serve the gRPC surface until the given shutdown future resolves.
///
/// # Arguments
///
/// * `engine` - The running engine to expose.
/// * `addr` - Socket address to listen on, e.g. `"127.0.0.1:8080"`.
/// * `shutdown` - Future whose completion stops the server gracefully.
///
/// # Errors
///
/// [`ServeError::Addr`] for an unparseable address;
/// [`ServeError::Transport`] for bind or serve failures.
pub async fn serve_with_shutdown(
    engine: Engine,
    addr: &str,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let addr = addr.parse()?;
    tracing::info!(%addr, "serving gRPC surface");
    tonic::transport::Server::builder()
        .add_service(ViewTallyServer::new(TallyService::new(engine)))
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}

/// Serve the gRPC surface until the process is killed.
///
/// See [`serve_with_shutdown`] for errors.
pub async fn serve(engine: Engine, addr: &str) -> Result<(), ServeError> {
    serve_with_shutdown(engine, addr, std::future::pending()).await
}
