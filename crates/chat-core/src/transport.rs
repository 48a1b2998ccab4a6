//! External transport contract and an in-memory implementation.
//!
//! The HTTP and live-event transports belong to the embedding application;
//! the core only depends on [`ChatTransport`]. [`InMemoryTransport`] plays the
//! server for the smoke binary and tests, with scripted failures and gates that
//! hold calls open to reproduce races.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use crate::{
    channel::{LiveEventHub, LiveEventStream},
    error::{TransportError, TransportErrorCategory},
    lock,
    normalization::wire_message_id,
    types::{Actor, LiveEvent, SendRequest, WireMessage, WireUnreadInfo},
};

/// Names of the transport operations, for errors, logs and failure injection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportOp {
    FetchHistory,
    SendMessage,
    EditMessage,
    DeleteMessage,
    FetchUnreadInfo,
    MarkGroupRead,
    MarkMessagesRead,
}

impl TransportOp {
    /// Operation name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchHistory => "fetch_history",
            Self::SendMessage => "send_message",
            Self::EditMessage => "edit_message",
            Self::DeleteMessage => "delete_message",
            Self::FetchUnreadInfo => "fetch_unread_info",
            Self::MarkGroupRead => "mark_group_read",
            Self::MarkMessagesRead => "mark_messages_read",
        }
    }
}

impl fmt::Display for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response and live-event operations consumed by the core.
///
/// `mark_group_read` and `mark_messages_read` must be idempotent. `send_message`
/// is not, so implementations must not retry it blindly.
pub trait ChatTransport: Send + Sync + 'static {
    fn fetch_history(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<Vec<WireMessage>, TransportError>> + Send;

    fn send_message(
        &self,
        request: SendRequest,
    ) -> impl Future<Output = Result<WireMessage, TransportError>> + Send;

    fn edit_message(
        &self,
        message_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<WireMessage, TransportError>> + Send;

    fn delete_message(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn fetch_unread_info(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<WireUnreadInfo, TransportError>> + Send;

    /// Catch the actor up fully in one group.
    fn mark_group_read(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Acknowledge a batch of messages.
    fn mark_messages_read(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Open a live-event subscription; dropping the stream unsubscribes.
    fn subscribe_live_events(&self) -> LiveEventStream;
}

#[derive(Debug, Default)]
struct ServerState {
    histories: HashMap<String, Vec<WireMessage>>,
    unread: HashMap<String, WireUnreadInfo>,
    next_id: u64,
    failures: HashMap<TransportOp, VecDeque<TransportError>>,
    gates: HashMap<TransportOp, Arc<Semaphore>>,
    calls: HashMap<TransportOp, usize>,
    mark_read_batches: Vec<Vec<String>>,
    group_read_calls: Vec<String>,
}

/// In-process stand-in for the chat server.
///
/// Sent messages get ids `m1`, `m2`, ... in order and are authored by the
/// configured actor.
#[derive(Clone, Debug)]
pub struct InMemoryTransport {
    actor: Actor,
    state: Arc<Mutex<ServerState>>,
    live: LiveEventHub,
}

impl InMemoryTransport {
    /// Create an empty server acting for `actor`.
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            state: Arc::new(Mutex::new(ServerState::default())),
            live: LiveEventHub::default(),
        }
    }

    /// Replace a group's stored history.
    pub fn seed_history(&self, group_id: &str, messages: Vec<WireMessage>) {
        lock(&self.state)
            .histories
            .insert(group_id.to_owned(), messages);
    }

    /// Set the unread snapshot returned for a group.
    pub fn seed_unread(&self, group_id: &str, info: WireUnreadInfo) {
        lock(&self.state).unread.insert(group_id.to_owned(), info);
    }

    /// Push a live event to every subscriber; returns how many received it.
    pub fn publish_live(&self, group_id: &str, message: WireMessage) -> usize {
        self.live.publish(LiveEvent {
            group_id: group_id.to_owned(),
            message,
        })
    }

    /// The hub behind `subscribe_live_events`.
    pub fn live_hub(&self) -> &LiveEventHub {
        &self.live
    }

    /// Make the next call of `op` fail with `error`. Failures queue up.
    pub fn fail_next(&self, op: TransportOp, error: TransportError) {
        lock(&self.state)
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Hold every call of `op` open until released with [`Self::release`].
    pub fn gate(&self, op: TransportOp) {
        lock(&self.state)
            .gates
            .insert(op, Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held (or future) calls of `op` proceed.
    pub fn release(&self, op: TransportOp, count: usize) {
        if let Some(gate) = lock(&self.state).gates.get(&op) {
            gate.add_permits(count);
        }
    }

    /// Remove the gate for `op` and let every held call proceed.
    pub fn open(&self, op: TransportOp) {
        if let Some(gate) = lock(&self.state).gates.remove(&op) {
            gate.close();
        }
    }

    /// How many times `op` was called, including held and failed calls.
    pub fn call_count(&self, op: TransportOp) -> usize {
        lock(&self.state).calls.get(&op).copied().unwrap_or(0)
    }

    /// Every `mark_messages_read` batch, in call order.
    pub fn mark_read_batches(&self) -> Vec<Vec<String>> {
        lock(&self.state).mark_read_batches.clone()
    }

    /// Group ids passed to `mark_group_read`, in call order.
    pub fn group_read_calls(&self) -> Vec<String> {
        lock(&self.state).group_read_calls.clone()
    }

    /// Raw history currently stored for a group.
    pub fn history(&self, group_id: &str) -> Vec<WireMessage> {
        lock(&self.state)
            .histories
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Count the call, wait at the gate, then pop a scripted failure.
    async fn enter(&self, op: TransportOp) -> Result<(), TransportError> {
        let gate = {
            let mut state = lock(&self.state);
            *state.calls.entry(op).or_default() += 1;
            state.gates.get(&op).cloned()
        };

        if let Some(gate) = gate {
            // A closed gate means it was opened for good.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        match lock(&self.state)
            .failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_message<R>(
        &self,
        message_id: &str,
        apply: impl FnOnce(&mut Value) -> R,
    ) -> Result<R, TransportError> {
        let mut state = lock(&self.state);
        state
            .histories
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|message| wire_message_id(message).as_deref() == Some(message_id))
            .map(|message| apply(&mut message.0))
            .ok_or_else(|| {
                TransportError::new(
                    TransportErrorCategory::Rejected,
                    "message_not_found",
                    format!("message not found: {message_id}"),
                )
            })
    }
}

impl ChatTransport for InMemoryTransport {
    async fn fetch_history(&self, group_id: &str) -> Result<Vec<WireMessage>, TransportError> {
        self.enter(TransportOp::FetchHistory).await?;
        Ok(self.history(group_id))
    }

    async fn send_message(&self, request: SendRequest) -> Result<WireMessage, TransportError> {
        self.enter(TransportOp::SendMessage).await?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut state = lock(&self.state);
        state.next_id += 1;
        let message = WireMessage(json!({
            "_id": format!("m{}", state.next_id),
            "group": request.group_id,
            "sender": { "_id": self.actor.id, "firstName": self.actor.display_name },
            "content": request.content,
            "messageType": request.kind.as_str(),
            "metadata": request.metadata,
            "createdAt": now,
            "updatedAt": now,
            "readBy": [self.actor.id],
        }));
        state
            .histories
            .entry(request.group_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn edit_message(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<WireMessage, TransportError> {
        self.enter(TransportOp::EditMessage).await?;

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.with_message(message_id, |message| {
            if let Some(fields) = message.as_object_mut() {
                fields.insert("content".into(), json!(content));
                fields.insert("isEdited".into(), json!(true));
                fields.insert("editedAt".into(), json!(now));
                fields.insert("updatedAt".into(), json!(now));
            }
            WireMessage(message.clone())
        })
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), TransportError> {
        self.enter(TransportOp::DeleteMessage).await?;
        self.with_message(message_id, |message| {
            if let Some(fields) = message.as_object_mut() {
                fields.insert("isDeleted".into(), json!(true));
            }
        })
    }

    async fn fetch_unread_info(&self, group_id: &str) -> Result<WireUnreadInfo, TransportError> {
        self.enter(TransportOp::FetchUnreadInfo).await?;
        Ok(lock(&self.state)
            .unread
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_group_read(&self, group_id: &str) -> Result<(), TransportError> {
        self.enter(TransportOp::MarkGroupRead).await?;
        let mut state = lock(&self.state);
        state.group_read_calls.push(group_id.to_owned());
        state.unread.remove(group_id);
        Ok(())
    }

    async fn mark_messages_read(&self, ids: &[String]) -> Result<(), TransportError> {
        self.enter(TransportOp::MarkMessagesRead).await?;
        lock(&self.state).mark_read_batches.push(ids.to_vec());
        Ok(())
    }

    fn subscribe_live_events(&self) -> LiveEventStream {
        self.live.subscribe()
    }
}
