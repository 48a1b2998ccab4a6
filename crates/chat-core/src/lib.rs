//! Chat synchronization core for group conversations.
//!
//! Keeps each group's message timeline consistent across optimistic local
//! sends, server confirmations and live events from other participants, while
//! tracking unread state and batching read receipts.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Live-event and change-notification channels.
pub mod channel;
/// Runtime tuning loaded from the environment.
pub mod config;
/// Optimistic send, edit, delete and history loading.
pub mod coordinator;
/// Composition root wiring every component for one actor.
pub mod engine;
/// Transport and core error types.
pub mod error;
/// Live-event subscription, dedup and reconciliation.
pub mod listener;
/// Wire payload normalization.
pub mod normalization;
/// Debounced read-receipt batching.
pub mod receipts;
/// Ordered, deduplicated per-group timelines.
pub mod timeline;
/// External transport contract and in-memory implementation.
pub mod transport;
/// Canonical message model and wire types.
pub mod types;
/// Unread counter state machine.
pub mod unread;

pub use channel::{LiveEventHub, LiveEventStream, SyncEventStream, SyncNotifier};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::SendCoordinator;
pub use engine::ChatSync;
pub use error::{SyncError, TransportError, TransportErrorCategory};
pub use listener::{LiveEventOutcome, LiveUpdateListener, ViewActivity};
pub use normalization::{normalize_message, normalize_unread_info, wire_message_id};
pub use receipts::ReadReceiptBatcher;
pub use timeline::{ReconcileOutcome, TimelineCache, UpsertOutcome};
pub use transport::{ChatTransport, InMemoryTransport, TransportOp};
pub use types::{
    Actor, LiveEvent, Message, MessageId, MessageKind, PLACEHOLDER_PREFIX, SendRequest, SyncEvent,
    UnreadInfo, WireMessage, WireUnreadInfo,
};
pub use unread::{MarkGroupRead, UnreadCounter, UnreadTransition};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
///
/// Every critical section in this crate leaves its state consistent before it
/// can panic, so the inner value is always safe to reuse.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
