//! Push notifications for operation progress and completion.
//!
//! The transport (WebSocket hub, SSE, ...) lives outside this crate; it
//! subscribes to a [`BroadcastNotifier`] or provides its own [`Notifier`].

pub mod events;

pub use events::{OperationCompleteEvent, OperationEvent, OperationProgressEvent};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use crate::Result;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Sink for operation events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Periodic progress push.
    async fn send_progress(&self, event: OperationProgressEvent) -> Result<()>;

    /// One-shot completion push.
    async fn send_complete(&self, event: OperationCompleteEvent) -> Result<()>;
}

/// Notifier that fans events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<OperationEvent>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: OperationEvent) {
        // No subscribers is fine.
        if self.tx.send(event).is_err() {
            trace!("No operation event subscribers");
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn send_progress(&self, event: OperationProgressEvent) -> Result<()> {
        self.publish(OperationEvent::Progress(event));
        Ok(())
    }

    async fn send_complete(&self, event: OperationCompleteEvent) -> Result<()> {
        self.publish(OperationEvent::Complete(event));
        Ok(())
    }
}
