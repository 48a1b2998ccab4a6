use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    channel::LiveEventStream,
    lock,
    normalization::{normalize_message, wire_message_id},
    timeline::{ReconcileOutcome, TimelineCache},
    types::{Actor, LiveEvent},
    unread::{UnreadCounter, UnreadTransition},
};

const DEFAULT_PROCESSED_CAPACITY: usize = 500;

/// Which groups currently have a consuming view on screen.
#[derive(Debug, Default)]
pub struct ViewActivity {
    active: Mutex<HashSet<String>>,
}

impl ViewActivity {
    /// Mark the group's view as shown or hidden.
    pub fn set_active(&self, group_id: &str, active: bool) {
        let mut groups = lock(&self.active);
        let changed = if active {
            groups.insert(group_id.to_owned())
        } else {
            groups.remove(group_id)
        };
        if changed {
            trace!(%group_id, active, "view activity changed");
        }
    }

    /// Whether the group's view is on screen.
    pub fn is_active(&self, group_id: &str) -> bool {
        lock(&self.active).contains(group_id)
    }
}

/// What [`LiveUpdateListener::handle_event`] did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEventOutcome {
    /// The payload carried no usable id.
    Malformed,
    /// The id was already processed.
    Duplicate,
    /// Authored by the actor; the send path reconciles it.
    OwnMessage,
    Inserted,
    Merged,
    ReplacedPlaceholder,
}

impl From<ReconcileOutcome> for LiveEventOutcome {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Inserted => Self::Inserted,
            ReconcileOutcome::Merged => Self::Merged,
            ReconcileOutcome::ReplacedPlaceholder => Self::ReplacedPlaceholder,
        }
    }
}

/// Bounded FIFO set of processed event ids.
#[derive(Debug)]
struct ProcessedIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl ProcessedIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn record(&mut self, id: String) {
        if !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

#[derive(Debug)]
struct Subscription {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct ListenerInner {
    actor: Actor,
    timeline: Arc<TimelineCache>,
    unread: Arc<UnreadCounter>,
    views: Arc<ViewActivity>,
    processed: Mutex<ProcessedIds>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

/// Applies pushed messages from other participants to the timeline.
///
/// Holds at most one live subscription per mounted group and owns its
/// lifecycle.
#[derive(Clone, Debug)]
pub struct LiveUpdateListener {
    inner: Arc<ListenerInner>,
}

impl LiveUpdateListener {
    /// Create a listener that remembers the last `capacity` event ids.
    pub fn new(
        actor: Actor,
        timeline: Arc<TimelineCache>,
        unread: Arc<UnreadCounter>,
        views: Arc<ViewActivity>,
        processed_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                actor,
                timeline,
                unread,
                views,
                processed: Mutex::new(ProcessedIds::new(processed_capacity)),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Listener with the default dedup window.
    pub fn with_defaults(
        actor: Actor,
        timeline: Arc<TimelineCache>,
        unread: Arc<UnreadCounter>,
        views: Arc<ViewActivity>,
    ) -> Self {
        Self::new(actor, timeline, unread, views, DEFAULT_PROCESSED_CAPACITY)
    }

    /// Shared view activity consulted for unread bumps.
    pub fn views(&self) -> &Arc<ViewActivity> {
        &self.inner.views
    }

    /// Process one live event.
    pub fn handle_event(&self, event: &LiveEvent) -> LiveEventOutcome {
        self.inner.handle_event(event)
    }

    /// Start pumping `stream` into the timeline for `group_id`.
    ///
    /// Events for other groups are skipped. Mounting an already mounted group
    /// replaces its subscription.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn mount(&self, group_id: &str, mut stream: LiveEventStream) {
        let mut subscriptions = lock(&self.inner.subscriptions);
        if let Some(previous) = subscriptions.remove(group_id) {
            previous.stop.cancel();
            previous.task.abort();
            debug!(%group_id, "replacing live subscription");
        }

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let inner = Arc::clone(&self.inner);
        let group = group_id.to_owned();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_child.cancelled() => break,
                    received = stream.recv() => match received {
                        Ok(event) if event.group_id == group => {
                            inner.deliver(&stop_child, &event);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(group_id = %group, skipped, "live stream lagged");
                        }
                        Err(RecvError::Closed) => {
                            debug!(group_id = %group, "live stream closed");
                            break;
                        }
                    },
                }
            }
        });

        subscriptions.insert(group_id.to_owned(), Subscription { stop, task });
        debug!(%group_id, "live subscription mounted");
    }

    /// Drop the group's subscription. No event is applied for it afterwards.
    pub fn unmount(&self, group_id: &str) -> bool {
        let mut subscriptions = lock(&self.inner.subscriptions);
        let Some(subscription) = subscriptions.remove(group_id) else {
            return false;
        };
        subscription.stop.cancel();
        subscription.task.abort();
        debug!(%group_id, "live subscription unmounted");
        true
    }

    /// Whether a live subscription exists for the group.
    pub fn is_mounted(&self, group_id: &str) -> bool {
        lock(&self.inner.subscriptions).contains_key(group_id)
    }

    /// Drop every subscription.
    pub fn unmount_all(&self) {
        let mut subscriptions = lock(&self.inner.subscriptions);
        for (group_id, subscription) in subscriptions.drain() {
            subscription.stop.cancel();
            subscription.task.abort();
            trace!(%group_id, "live subscription dropped");
        }
    }
}

impl ListenerInner {
    /// Apply an event from a pump unless its subscription was cancelled.
    fn deliver(&self, stop: &CancellationToken, event: &LiveEvent) {
        let _subscriptions = lock(&self.subscriptions);
        if stop.is_cancelled() {
            return;
        }
        self.handle_event(event);
    }

    fn handle_event(&self, event: &LiveEvent) -> LiveEventOutcome {
        let group_id = event.group_id.as_str();
        let Some(message_id) = wire_message_id(&event.message) else {
            warn!(%group_id, "live event without message id ignored");
            return LiveEventOutcome::Malformed;
        };

        let mut processed = lock(&self.processed);
        if processed.contains(&message_id) {
            trace!(%group_id, %message_id, "duplicate live event");
            return LiveEventOutcome::Duplicate;
        }

        let message = normalize_message(&event.message, group_id);
        if message.is_authored_by(&self.actor.id) {
            trace!(%group_id, %message_id, "own live event skipped");
            return LiveEventOutcome::OwnMessage;
        }

        let outcome = self.timeline.reconcile_live(group_id, message);
        processed.record(message_id.clone());

        if outcome != ReconcileOutcome::Merged && !self.views.is_active(group_id) {
            self.unread
                .apply(group_id, UnreadTransition::ForeignMessageWhileInactive);
        }
        debug!(%group_id, %message_id, ?outcome, "live event applied");
        outcome.into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        channel::LiveEventHub,
        types::{MessageId, WireMessage},
    };

    struct Fixture {
        timeline: Arc<TimelineCache>,
        unread: Arc<UnreadCounter>,
        listener: LiveUpdateListener,
    }

    fn fixture(capacity: usize) -> Fixture {
        let timeline = Arc::new(TimelineCache::default());
        let unread = Arc::new(UnreadCounter::default());
        let listener = LiveUpdateListener::new(
            Actor::new("u-alice", "Alice"),
            Arc::clone(&timeline),
            Arc::clone(&unread),
            Arc::new(ViewActivity::default()),
            capacity,
        );
        Fixture {
            timeline,
            unread,
            listener,
        }
    }

    fn event(group: &str, id: &str, sender: &str, content: &str) -> LiveEvent {
        LiveEvent {
            group_id: group.into(),
            message: WireMessage(json!({
                "id": id,
                "groupId": group,
                "senderId": sender,
                "senderName": sender,
                "content": content,
                "type": "text",
                "timestamp": "2024-03-01T10:00:00Z",
            })),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn foreign_message_while_inactive_counts_once() {
        let fx = fixture(500);
        let delivery = event("g1", "m9", "u-bob", "hey");

        assert_eq!(fx.listener.handle_event(&delivery), LiveEventOutcome::Inserted);
        assert_eq!(fx.unread.get("g1").unread_count, 1);
        let once = fx.timeline.get("g1");

        assert_eq!(fx.listener.handle_event(&delivery), LiveEventOutcome::Duplicate);
        assert_eq!(fx.unread.get("g1").unread_count, 1);
        assert_eq!(fx.timeline.get("g1"), once);
    }

    #[test]
    fn active_view_does_not_count_unread() {
        let fx = fixture(500);
        fx.listener.views().set_active("g1", true);

        fx.listener.handle_event(&event("g1", "m9", "u-bob", "hey"));
        assert_eq!(fx.timeline.len("g1"), 1);
        assert_eq!(fx.unread.get("g1").unread_count, 0);

        fx.listener.views().set_active("g1", false);
        fx.listener.handle_event(&event("g1", "m10", "u-bob", "again"));
        assert_eq!(fx.unread.get("g1").unread_count, 1);
    }

    #[test]
    fn own_messages_are_left_to_the_send_path() {
        let fx = fixture(500);
        let own = event("g1", "m1", "u-alice", "hi");

        assert_eq!(fx.listener.handle_event(&own), LiveEventOutcome::OwnMessage);
        assert!(fx.timeline.is_empty("g1"));
        // Not recorded, so a later delivery is evaluated again.
        assert_eq!(fx.listener.handle_event(&own), LiveEventOutcome::OwnMessage);
        assert_eq!(fx.unread.get("g1").unread_count, 0);
    }

    #[test]
    fn events_without_id_are_ignored() {
        let fx = fixture(500);
        let malformed = LiveEvent {
            group_id: "g1".into(),
            message: WireMessage(json!({ "content": "no id", "senderId": "u-bob" })),
        };

        assert_eq!(fx.listener.handle_event(&malformed), LiveEventOutcome::Malformed);
        assert!(fx.timeline.is_empty("g1"));
        assert_eq!(fx.unread.get("g1").unread_count, 0);
    }

    #[test]
    fn ids_evicted_from_dedup_window_merge_without_counting() {
        let fx = fixture(1);
        fx.listener.handle_event(&event("g1", "m1", "u-bob", "first"));
        fx.listener.handle_event(&event("g1", "m2", "u-bob", "second"));
        assert_eq!(fx.unread.get("g1").unread_count, 2);

        let edited = event("g1", "m1", "u-bob", "first (edited)");
        assert_eq!(fx.listener.handle_event(&edited), LiveEventOutcome::Merged);
        assert_eq!(fx.unread.get("g1").unread_count, 2);
        assert_eq!(fx.timeline.len("g1"), 2);
        assert_eq!(
            fx.timeline.find("g1", "m1").map(|m| m.content),
            Some("first (edited)".to_owned())
        );

        assert_eq!(fx.listener.handle_event(&edited), LiveEventOutcome::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn mounted_group_pumps_its_own_events() {
        let fx = fixture(500);
        let hub = LiveEventHub::new(16);
        fx.listener.mount("g1", hub.subscribe());
        assert!(fx.listener.is_mounted("g1"));

        hub.publish(event("g1", "m1", "u-bob", "for g1"));
        hub.publish(event("g2", "x1", "u-bob", "for g2"));
        settle().await;

        assert_eq!(fx.timeline.len("g1"), 1);
        assert!(fx.timeline.is_empty("g2"));
        assert_eq!(fx.timeline.get("g1")[0].id, MessageId::confirmed("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn unmounted_group_ignores_later_events() {
        let fx = fixture(500);
        let hub = LiveEventHub::new(16);
        fx.listener.mount("g1", hub.subscribe());
        assert!(fx.listener.unmount("g1"));
        assert!(!fx.listener.is_mounted("g1"));
        assert!(!fx.listener.unmount("g1"));

        hub.publish(event("g1", "m1", "u-bob", "late"));
        settle().await;

        assert!(fx.timeline.is_empty("g1"));
        assert_eq!(fx.unread.get("g1").unread_count, 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remount_keeps_a_single_subscription() {
        let fx = fixture(500);
        let hub = LiveEventHub::new(16);
        fx.listener.mount("g1", hub.subscribe());
        fx.listener.mount("g1", hub.subscribe());
        settle().await;
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(event("g1", "m1", "u-bob", "once"));
        settle().await;
        assert_eq!(fx.timeline.len("g1"), 1);
        assert_eq!(fx.unread.get("g1").unread_count, 1);
    }
}
