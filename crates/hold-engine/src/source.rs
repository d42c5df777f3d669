//! Sources of published events and the sink they feed.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::PublishEvent;
use crate::engine::Engine;
use crate::error::SourceError;

/// Where a [`PublishSource`] hands its events.
pub trait PublishSink: Send + Sync {
    fn publish(&self, event: PublishEvent);

    /// Events were lost upstream; every subscriber must resynchronize.
    fn resync_all(&self);
}

impl PublishSink for Engine {
    fn publish(&self, event: PublishEvent) {
        self.ingest_publish(event);
    }

    fn resync_all(&self) {
        self.dispatcher().mark_all_overflowed();
    }
}

/// Feeds events to a sink until the upstream ends.
///
/// Events for one channel must reach the sink in publish order; a source
/// that cannot guarantee this will see subscribers closed on gaps.
#[async_trait]
pub trait PublishSource: Send {
    async fn run(self, sink: Arc<dyn PublishSink>);
}

pub fn spawn<S>(source: S, sink: Arc<dyn PublishSink>) -> JoinHandle<()>
where
    S: PublishSource + 'static,
{
    tokio::spawn(source.run(sink))
}

/// In-process publish bus for embedding and tests.
#[derive(Debug, Clone)]
pub struct LocalPublishBus {
    sender: broadcast::Sender<PublishEvent>,
}

impl LocalPublishBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many sources received the event.
    pub fn publish(&self, event: PublishEvent) -> Result<usize, SourceError> {
        self.sender
            .send(event)
            .map_err(|_| SourceError::NoSubscribers)
    }

    pub fn subscribe(&self) -> LocalPublishSource {
        LocalPublishSource {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for LocalPublishBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

pub struct LocalPublishSource {
    receiver: broadcast::Receiver<PublishEvent>,
}

#[async_trait]
impl PublishSource for LocalPublishSource {
    async fn run(mut self, sink: Arc<dyn PublishSink>) {
        loop {
            match self.receiver.recv().await {
                Ok(event) => sink.publish(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "hold.source",
                        skipped,
                        "publish source lagged; forcing subscribers to resync"
                    );
                    counter!("hold_engine_source_lagged_total", 1);
                    sink.resync_all();
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(target: "hold.source", "local publish bus closed");
    }
}
