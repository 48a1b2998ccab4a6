use tokio::sync::broadcast;

use crate::types::{LiveEvent, SyncEvent};

/// Live-event receiver handed out by transports. Dropping it unsubscribes.
pub type LiveEventStream = broadcast::Receiver<LiveEvent>;

/// Change-notification receiver for the presentation layer.
pub type SyncEventStream = broadcast::Receiver<SyncEvent>;

const DEFAULT_BUFFER: usize = 256;

/// Fan-out point for pushed live events, owned by a transport implementation.
#[derive(Clone, Debug)]
pub struct LiveEventHub {
    tx: broadcast::Sender<LiveEvent>,
}

impl LiveEventHub {
    /// Create a hub holding up to `buffer` undelivered events per subscriber.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> LiveEventStream {
        self.tx.subscribe()
    }

    /// Push an event to every subscriber and return how many received it.
    pub fn publish(&self, event: LiveEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveEventHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

/// Emitter for [`SyncEvent`] change notifications.
#[derive(Clone, Debug)]
pub struct SyncNotifier {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncNotifier {
    /// Create a notifier holding up to `buffer` undelivered events per subscriber.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Subscribe to emitted change notifications.
    pub fn subscribe(&self) -> SyncEventStream {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for SyncNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}
