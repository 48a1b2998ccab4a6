use std::{
    collections::HashMap,
    mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
    lock,
    timeline::TimelineCache,
    transport::ChatTransport,
    types::Actor,
    unread::{UnreadCounter, UnreadTransition},
};

#[derive(Debug)]
struct GroupReceipts {
    /// Observed ids not yet sent, in observation order.
    pending: Vec<String>,
    /// Armed debounce timer, if any.
    timer: Option<JoinHandle<()>>,
    /// Bumped on every re-arm; a timer only flushes if its generation is current.
    generation: u64,
    in_flight: bool,
    /// Identifies one mount of the group; a cancelled group gets a new one.
    epoch: u64,
}

impl GroupReceipts {
    fn new(epoch: u64) -> Self {
        Self {
            pending: Vec::new(),
            timer: None,
            generation: 0,
            in_flight: false,
            epoch,
        }
    }
}

struct Inner<T> {
    transport: Arc<T>,
    timeline: Arc<TimelineCache>,
    unread: Arc<UnreadCounter>,
    actor: Actor,
    debounce: Duration,
    groups: Mutex<HashMap<String, GroupReceipts>>,
    next_epoch: AtomicU64,
}

/// Collects "message seen" observations per group and sends them as one
/// `mark_messages_read` call once the debounce window passes without a new
/// observation.
///
/// Timers run on the ambient tokio runtime, so [`Self::observe`] must be
/// called from within one.
pub struct ReadReceiptBatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ReadReceiptBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ReadReceiptBatcher<T> {
    /// Stop collecting for every group. Used when the owner shuts down.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = lock(&self.inner.groups).drain().collect();
        for (group_id, state) in drained {
            if let Some(timer) = state.timer {
                timer.abort();
            }
            trace!(%group_id, dropped = state.pending.len(), "read receipts shut down");
        }
    }
}

impl<T: ChatTransport> ReadReceiptBatcher<T> {
    /// Create a batcher that flushes `debounce` after the last observation.
    pub fn new(
        transport: Arc<T>,
        timeline: Arc<TimelineCache>,
        unread: Arc<UnreadCounter>,
        actor: Actor,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                timeline,
                unread,
                actor,
                debounce,
                groups: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Record that `message_id` became visible to the actor.
    ///
    /// Returns `true` when the id was queued. Placeholders, structural
    /// messages, the actor's own messages, messages already read by the actor
    /// and ids unknown to the timeline are ignored.
    pub fn observe(&self, group_id: &str, message_id: &str) -> bool {
        let inner = &self.inner;
        let Some(message) = inner.timeline.find(group_id, message_id) else {
            trace!(%group_id, %message_id, "observed message not in timeline");
            return false;
        };
        if message.is_placeholder()
            || message.kind.is_structural()
            || message.is_authored_by(&inner.actor.id)
            || message.is_read_by(&inner.actor.id)
        {
            return false;
        }

        let mut groups = lock(&inner.groups);
        let state = groups.entry(group_id.to_owned()).or_insert_with(|| {
            GroupReceipts::new(inner.next_epoch.fetch_add(1, Ordering::Relaxed))
        });
        if !state.pending.iter().any(|id| id == message_id) {
            state.pending.push(message_id.to_owned());
        }
        inner.arm(group_id, state);
        true
    }

    /// Stop collecting for a group without a final flush.
    ///
    /// A request already in flight completes, but it no longer resets the
    /// group's unread state. The group stays marked in flight until that
    /// request returns, so a remount cannot start a second one.
    pub fn cancel_group(&self, group_id: &str) {
        let mut groups = lock(&self.inner.groups);
        let Some(state) = groups.get_mut(group_id) else {
            return;
        };
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        state.epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let dropped = mem::take(&mut state.pending).len();
        let in_flight = state.in_flight;
        if !in_flight {
            groups.remove(group_id);
        }
        debug!(%group_id, dropped, in_flight, "read receipts cancelled");
    }

    /// Ids queued for the next flush.
    pub fn pending(&self, group_id: &str) -> Vec<String> {
        lock(&self.inner.groups)
            .get(group_id)
            .map(|state| state.pending.clone())
            .unwrap_or_default()
    }

    /// Whether a debounce timer is armed for the group.
    pub fn is_collecting(&self, group_id: &str) -> bool {
        lock(&self.inner.groups)
            .get(group_id)
            .is_some_and(|state| state.timer.is_some())
    }

    /// Whether a `mark_messages_read` call for the group has not returned yet.
    pub fn is_in_flight(&self, group_id: &str) -> bool {
        lock(&self.inner.groups)
            .get(group_id)
            .is_some_and(|state| state.in_flight)
    }
}

impl<T: ChatTransport> Inner<T> {
    /// Cancel the group's timer and schedule a fresh one.
    fn arm(self: &Arc<Self>, group_id: &str, state: &mut GroupReceipts) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(%group_id, "no tokio runtime; read receipts stay pending");
            return;
        };

        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let this = Arc::clone(self);
        let group = group_id.to_owned();
        let debounce = self.debounce;
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            this.flush(group, generation).await;
        }));
    }

    async fn flush(self: Arc<Self>, group_id: String, generation: u64) {
        let (batch, epoch) = {
            let mut groups = lock(&self.groups);
            let Some(state) = groups.get_mut(&group_id) else {
                return;
            };
            if state.generation != generation {
                return;
            }
            state.timer = None;
            if state.in_flight || state.pending.is_empty() {
                return;
            }
            state.in_flight = true;
            (mem::take(&mut state.pending), state.epoch)
        };

        debug!(%group_id, count = batch.len(), "flushing read receipts");
        let acknowledged = match self.transport.mark_messages_read(&batch).await {
            Ok(()) => {
                let changed = self.timeline.mark_many_read(&group_id, &batch, &self.actor.id);
                debug!(%group_id, changed, "read receipts acknowledged");
                true
            }
            Err(err) => {
                warn!(
                    %group_id,
                    count = batch.len(),
                    error = %err,
                    "read receipts dropped"
                );
                false
            }
        };

        let current = {
            let mut groups = lock(&self.groups);
            let Some(state) = groups.get_mut(&group_id) else {
                return;
            };
            state.in_flight = false;
            let current = state.epoch == epoch;
            if !state.pending.is_empty() && state.timer.is_none() {
                self.arm(&group_id, state);
            } else if !current && state.pending.is_empty() && state.timer.is_none() {
                // Cancelled while in flight and never observed again.
                groups.remove(&group_id);
            }
            current
        };

        if acknowledged && current {
            self.unread.apply(&group_id, UnreadTransition::ReceiptsFlushed);
        }
    }
}
