use std::{collections::HashMap, sync::Mutex};

use tracing::{debug, warn};

use crate::{
    channel::SyncNotifier,
    lock,
    transport::ChatTransport,
    types::{Message, SyncEvent, UnreadInfo},
};

/// Inputs that move a group's unread state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnreadTransition {
    /// Replace state with a server snapshot (`fetch_unread_info`).
    Loaded(UnreadInfo),
    /// A batched read-receipt flush succeeded.
    ReceiptsFlushed,
    /// The actor's own send was confirmed; sending implies having seen everything.
    OwnMessageConfirmed(Message),
    /// A foreign live message arrived while the group's view was not active.
    ForeignMessageWhileInactive,
    /// An explicit "mark group as read" request succeeded.
    GroupMarkedRead,
}

/// Outcome of [`UnreadCounter::mark_group_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkGroupRead {
    /// The server acknowledged and the count was reset.
    Acknowledged,
    /// Another request for this group is still running; nothing was sent.
    AlreadyInFlight,
    /// The request failed; state is unchanged and a later trigger retries.
    Failed,
}

impl UnreadInfo {
    /// Pure transition step. Counts saturate, so they never go below zero.
    pub fn next(mut self, transition: UnreadTransition) -> Self {
        match transition {
            UnreadTransition::Loaded(info) => return info,
            UnreadTransition::ReceiptsFlushed | UnreadTransition::GroupMarkedRead => {
                self.unread_count = 0;
            }
            UnreadTransition::OwnMessageConfirmed(message) => {
                self.last_read_message = Some(message);
            }
            UnreadTransition::ForeignMessageWhileInactive => {
                self.unread_count = self.unread_count.saturating_add(1);
            }
        }
        self
    }
}

#[derive(Debug, Default)]
struct GroupUnread {
    info: UnreadInfo,
    mark_read_in_flight: bool,
}

/// Per-group unread state machine.
#[derive(Debug, Default)]
pub struct UnreadCounter {
    groups: Mutex<HashMap<String, GroupUnread>>,
    notifier: SyncNotifier,
}

impl UnreadCounter {
    /// Create an empty counter that reports changes through `notifier`.
    pub fn new(notifier: SyncNotifier) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Current state; unknown groups read as zero unread.
    pub fn get(&self, group_id: &str) -> UnreadInfo {
        lock(&self.groups)
            .get(group_id)
            .map(|group| group.info.clone())
            .unwrap_or_default()
    }

    /// Apply one transition and return the resulting state.
    pub fn apply(&self, group_id: &str, transition: UnreadTransition) -> UnreadInfo {
        let (before, after) = {
            let mut groups = lock(&self.groups);
            let group = groups.entry(group_id.to_owned()).or_default();
            let before = group.info.unread_count;
            group.info = std::mem::take(&mut group.info).next(transition);
            (before, group.info.clone())
        };

        if before != after.unread_count {
            debug!(
                %group_id,
                from = before,
                to = after.unread_count,
                "unread count changed"
            );
        }
        self.notifier.emit(SyncEvent::UnreadChanged {
            group_id: group_id.to_owned(),
            unread_count: after.unread_count,
        });
        after
    }

    /// Destroy a group's state, for example when its view unmounts.
    pub fn reset_group(&self, group_id: &str) {
        if lock(&self.groups).remove(group_id).is_some() {
            self.notifier.emit(SyncEvent::UnreadChanged {
                group_id: group_id.to_owned(),
                unread_count: 0,
            });
        }
    }

    /// Whether a `mark_group_read` request for the group has not returned yet.
    pub fn is_mark_read_in_flight(&self, group_id: &str) -> bool {
        lock(&self.groups)
            .get(group_id)
            .is_some_and(|group| group.mark_read_in_flight)
    }

    /// Ask the server to catch the actor up fully in `group_id`.
    ///
    /// Only one request per group runs at a time; triggers arriving meanwhile
    /// return [`MarkGroupRead::AlreadyInFlight`] without a call.
    pub async fn mark_group_read<T: ChatTransport>(
        &self,
        transport: &T,
        group_id: &str,
    ) -> MarkGroupRead {
        let Some(_in_flight) = InFlight::begin(self, group_id) else {
            debug!(%group_id, "mark group read already in flight");
            return MarkGroupRead::AlreadyInFlight;
        };

        match transport.mark_group_read(group_id).await {
            Ok(()) => {
                self.apply(group_id, UnreadTransition::GroupMarkedRead);
                MarkGroupRead::Acknowledged
            }
            Err(err) => {
                warn!(%group_id, error = %err, "mark group read failed");
                MarkGroupRead::Failed
            }
        }
    }
}

/// Holds a group's in-flight flag and releases it on drop, also when the
/// request future is cancelled.
struct InFlight<'a> {
    counter: &'a UnreadCounter,
    group_id: &'a str,
}

impl<'a> InFlight<'a> {
    fn begin(counter: &'a UnreadCounter, group_id: &'a str) -> Option<Self> {
        let mut groups = lock(&counter.groups);
        let group = groups.entry(group_id.to_owned()).or_default();
        if group.mark_read_in_flight {
            return None;
        }
        group.mark_read_in_flight = true;
        Some(Self { counter, group_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(group) = lock(&self.counter.groups).get_mut(self.group_id) {
            group.mark_read_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use chrono::Utc;

    use super::*;
    use crate::{
        error::TransportError,
        transport::{InMemoryTransport, TransportOp},
        types::{Actor, MessageId, MessageKind},
    };

    fn message(id: &str) -> Message {
        Message {
            id: MessageId::confirmed(id),
            group_id: "g1".into(),
            sender_id: "u-alice".into(),
            sender_display: "Alice".into(),
            content: "hi".into(),
            kind: MessageKind::Text,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            edited_at: None,
            deleted: false,
            read_by: BTreeSet::new(),
        }
    }

    #[test]
    fn counts_foreign_messages_and_resets_on_flush() {
        let counter = UnreadCounter::default();
        counter.apply("g1", UnreadTransition::ForeignMessageWhileInactive);
        counter.apply("g1", UnreadTransition::ForeignMessageWhileInactive);
        assert_eq!(counter.get("g1").unread_count, 2);

        counter.apply("g1", UnreadTransition::ReceiptsFlushed);
        assert_eq!(counter.get("g1").unread_count, 0);
    }

    #[test]
    fn own_confirmation_moves_last_read_without_touching_count() {
        let counter = UnreadCounter::default();
        counter.apply("g1", UnreadTransition::ForeignMessageWhileInactive);
        let info = counter.apply("g1", UnreadTransition::OwnMessageConfirmed(message("m7")));
        assert_eq!(info.unread_count, 1);
        assert_eq!(
            info.last_read_message.map(|m| m.id),
            Some(MessageId::confirmed("m7"))
        );
    }

    #[test]
    fn resets_never_go_below_zero() {
        let mut info = UnreadInfo::default();
        for transition in [
            UnreadTransition::GroupMarkedRead,
            UnreadTransition::ReceiptsFlushed,
            UnreadTransition::ForeignMessageWhileInactive,
            UnreadTransition::GroupMarkedRead,
            UnreadTransition::GroupMarkedRead,
        ] {
            info = info.next(transition);
        }
        assert_eq!(info.unread_count, 0);

        let saturated = UnreadInfo {
            unread_count: u64::MAX,
            last_read_message: None,
        }
        .next(UnreadTransition::ForeignMessageWhileInactive);
        assert_eq!(saturated.unread_count, u64::MAX);
    }

    #[test]
    fn loaded_snapshot_replaces_state_and_groups_are_independent() {
        let counter = UnreadCounter::default();
        counter.apply(
            "g1",
            UnreadTransition::Loaded(UnreadInfo {
                unread_count: 5,
                last_read_message: Some(message("m1")),
            }),
        );
        counter.apply("g2", UnreadTransition::ForeignMessageWhileInactive);

        assert_eq!(counter.get("g1").unread_count, 5);
        assert_eq!(counter.get("g2").unread_count, 1);

        counter.reset_group("g1");
        assert_eq!(counter.get("g1"), UnreadInfo::default());
        assert_eq!(counter.get("g2").unread_count, 1);
    }

    #[tokio::test]
    async fn mark_group_read_resets_count_on_success() {
        let transport = InMemoryTransport::new(Actor::new("u-alice", "Alice"));
        let counter = UnreadCounter::default();
        counter.apply("g1", UnreadTransition::ForeignMessageWhileInactive);

        let outcome = counter.mark_group_read(&transport, "g1").await;
        assert_eq!(outcome, MarkGroupRead::Acknowledged);
        assert_eq!(counter.get("g1").unread_count, 0);
        assert!(!counter.is_mark_read_in_flight("g1"));
    }

    #[tokio::test]
    async fn mark_group_read_failure_keeps_count() {
        let transport = InMemoryTransport::new(Actor::new("u-alice", "Alice"));
        transport.fail_next(TransportOp::MarkGroupRead, TransportError::network("offline"));
        let counter = UnreadCounter::default();
        counter.apply("g1", UnreadTransition::ForeignMessageWhileInactive);

        let outcome = counter.mark_group_read(&transport, "g1").await;
        assert_eq!(outcome, MarkGroupRead::Failed);
        assert_eq!(counter.get("g1").unread_count, 1);
        assert!(!counter.is_mark_read_in_flight("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_group_read_request_in_flight() {
        let transport = Arc::new(InMemoryTransport::new(Actor::new("u-alice", "Alice")));
        transport.gate(TransportOp::MarkGroupRead);
        let counter = Arc::new(UnreadCounter::default());

        let first = tokio::spawn({
            let transport = Arc::clone(&transport);
            let counter = Arc::clone(&counter);
            async move { counter.mark_group_read(transport.as_ref(), "g1").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(counter.is_mark_read_in_flight("g1"));

        let second = counter.mark_group_read(transport.as_ref(), "g1").await;
        assert_eq!(second, MarkGroupRead::AlreadyInFlight);

        transport.release(TransportOp::MarkGroupRead, 1);
        assert_eq!(first.await.expect("join"), MarkGroupRead::Acknowledged);
        assert_eq!(transport.call_count(TransportOp::MarkGroupRead), 1);

        transport.open(TransportOp::MarkGroupRead);
        let third = counter.mark_group_read(transport.as_ref(), "g1").await;
        assert_eq!(third, MarkGroupRead::Acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_releases_in_flight_flag() {
        let transport = InMemoryTransport::new(Actor::new("u-alice", "Alice"));
        transport.gate(TransportOp::MarkGroupRead);
        let counter = UnreadCounter::default();

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            counter.mark_group_read(&transport, "g1"),
        )
        .await;
        assert!(attempt.is_err());
        assert!(!counter.is_mark_read_in_flight("g1"));
    }
}
