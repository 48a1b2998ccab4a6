use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::SyncError,
    normalization::{normalize_message, normalize_unread_info},
    timeline::TimelineCache,
    transport::{ChatTransport, TransportOp},
    types::{Actor, Message, MessageId, MessageKind, SendRequest, UnreadInfo},
    unread::{UnreadCounter, UnreadTransition},
};

/// Writes that go through the server, with an optimistic placeholder for sends.
pub struct SendCoordinator<T> {
    transport: Arc<T>,
    timeline: Arc<TimelineCache>,
    unread: Arc<UnreadCounter>,
    actor: Actor,
}

impl<T> Clone for SendCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            timeline: Arc::clone(&self.timeline),
            unread: Arc::clone(&self.unread),
            actor: self.actor.clone(),
        }
    }
}

impl<T: ChatTransport> SendCoordinator<T> {
    /// Create a coordinator writing into the shared timeline and unread state.
    pub fn new(
        transport: Arc<T>,
        timeline: Arc<TimelineCache>,
        unread: Arc<UnreadCounter>,
        actor: Actor,
    ) -> Self {
        Self {
            transport,
            timeline,
            unread,
            actor,
        }
    }

    /// The identity messages are sent as.
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Send a message, showing a placeholder until the server answers.
    ///
    /// On success the placeholder is swapped for the confirmed message, which
    /// is returned. On failure the placeholder is removed and the transport
    /// error is returned; nothing is retried. Dropping the future before the
    /// server answers also removes the placeholder.
    pub async fn send(
        &self,
        group_id: &str,
        content: &str,
        kind: MessageKind,
        metadata: Option<Value>,
    ) -> Result<Message, SyncError> {
        let placeholder = self.placeholder(group_id, content, kind, metadata.clone());
        let temp_id = placeholder.id.as_str().to_owned();
        self.timeline.upsert(group_id, placeholder);
        debug!(%group_id, %temp_id, "placeholder inserted");

        let rollback = Rollback {
            timeline: &self.timeline,
            group_id,
            temp_id: &temp_id,
            armed: true,
        };
        let request = SendRequest {
            group_id: group_id.to_owned(),
            content: content.to_owned(),
            kind,
            metadata,
        };

        match self.transport.send_message(request).await {
            Ok(wire) => {
                rollback.disarm();
                let confirmed = normalize_message(&wire, group_id);
                let outcome = self
                    .timeline
                    .replace_placeholder(group_id, &temp_id, confirmed.clone());
                debug!(
                    %group_id,
                    %temp_id,
                    message_id = %confirmed.id,
                    ?outcome,
                    "send confirmed"
                );
                self.unread.apply(
                    group_id,
                    UnreadTransition::OwnMessageConfirmed(confirmed.clone()),
                );
                Ok(confirmed)
            }
            Err(source) => {
                drop(rollback);
                warn!(
                    %group_id,
                    %temp_id,
                    error = %source,
                    "send failed; placeholder rolled back"
                );
                Err(SyncError::transport(TransportOp::SendMessage, source))
            }
        }
    }

    /// Edit a confirmed message and merge the server's copy.
    pub async fn edit(
        &self,
        group_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, SyncError> {
        let wire = self
            .transport
            .edit_message(message_id, content)
            .await
            .map_err(|source| SyncError::transport(TransportOp::EditMessage, source))?;
        let edited = normalize_message(&wire, group_id);
        self.timeline.upsert(group_id, edited.clone());
        debug!(%group_id, %message_id, "message edited");
        Ok(edited)
    }

    /// Delete a message on the server and flag it deleted locally.
    pub async fn delete(&self, group_id: &str, message_id: &str) -> Result<(), SyncError> {
        self.transport
            .delete_message(message_id)
            .await
            .map_err(|source| SyncError::transport(TransportOp::DeleteMessage, source))?;
        self.timeline.mark_deleted(group_id, message_id);
        debug!(%group_id, %message_id, "message deleted");
        Ok(())
    }

    /// Fetch a group's history and merge it into the timeline.
    pub async fn load_history(&self, group_id: &str) -> Result<usize, SyncError> {
        let messages = self.fetch_history(group_id).await?;
        let count = messages.len();
        self.timeline.upsert_many(group_id, messages);
        Ok(count)
    }

    /// Fetch and normalize a group's history without touching the timeline.
    pub async fn fetch_history(&self, group_id: &str) -> Result<Vec<Message>, SyncError> {
        let records = self
            .transport
            .fetch_history(group_id)
            .await
            .map_err(|source| SyncError::transport(TransportOp::FetchHistory, source))?;
        Ok(records
            .iter()
            .map(|record| normalize_message(record, group_id))
            .collect())
    }

    /// Replace the group's unread state with the server's snapshot.
    pub async fn load_unread(&self, group_id: &str) -> Result<UnreadInfo, SyncError> {
        let info = self.fetch_unread(group_id).await?;
        Ok(self.unread.apply(group_id, UnreadTransition::Loaded(info)))
    }

    /// Fetch the server's unread snapshot without applying it.
    pub async fn fetch_unread(&self, group_id: &str) -> Result<UnreadInfo, SyncError> {
        let wire = self
            .transport
            .fetch_unread_info(group_id)
            .await
            .map_err(|source| SyncError::transport(TransportOp::FetchUnreadInfo, source))?;
        Ok(normalize_unread_info(&wire, group_id))
    }

    fn placeholder(
        &self,
        group_id: &str,
        content: &str,
        kind: MessageKind,
        metadata: Option<Value>,
    ) -> Message {
        let now = Utc::now();
        Message {
            id: MessageId::placeholder(now),
            group_id: group_id.to_owned(),
            sender_id: self.actor.id.clone(),
            sender_display: self.actor.display_name.clone(),
            content: content.to_owned(),
            kind,
            metadata,
            created_at: now,
            updated_at: now,
            edited_at: None,
            deleted: false,
            read_by: BTreeSet::from([self.actor.id.clone()]),
        }
    }
}

/// Removes a placeholder unless disarmed.
struct Rollback<'a> {
    timeline: &'a TimelineCache,
    group_id: &'a str,
    temp_id: &'a str,
    armed: bool,
}

impl Rollback<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.timeline.remove(self.group_id, self.temp_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        error::{TransportError, TransportErrorCategory},
        transport::InMemoryTransport,
        types::{WireMessage, WireUnreadInfo},
    };

    struct Fixture {
        transport: Arc<InMemoryTransport>,
        timeline: Arc<TimelineCache>,
        unread: Arc<UnreadCounter>,
        coordinator: Arc<SendCoordinator<InMemoryTransport>>,
    }

    fn fixture() -> Fixture {
        let actor = Actor::new("u-alice", "Alice");
        let transport = Arc::new(InMemoryTransport::new(actor.clone()));
        let timeline = Arc::new(TimelineCache::default());
        let unread = Arc::new(UnreadCounter::default());
        let coordinator = Arc::new(SendCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&timeline),
            Arc::clone(&unread),
            actor,
        ));
        Fixture {
            transport,
            timeline,
            unread,
            coordinator,
        }
    }

    fn wire(id: &str, content: &str, created_at: &str) -> WireMessage {
        WireMessage(json!({
            "_id": id,
            "group": "g1",
            "sender": { "_id": "u-bob", "firstName": "Bob" },
            "content": content,
            "createdAt": created_at,
            "updatedAt": created_at,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_is_replaced_by_confirmed_message() {
        let fx = fixture();
        fx.transport.gate(TransportOp::SendMessage);

        let send = tokio::spawn({
            let coordinator = Arc::clone(&fx.coordinator);
            async move {
                coordinator
                    .send("g1", "hi", MessageKind::Text, None)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pending = fx.timeline.get("g1");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].id.as_str().starts_with("temp-"));
        assert!(pending[0].is_placeholder());
        assert_eq!(pending[0].content, "hi");
        assert!(pending[0].is_read_by("u-alice"));

        fx.transport.release(TransportOp::SendMessage, 1);
        let confirmed = send.await.expect("join").expect("send");
        assert_eq!(confirmed.id, MessageId::confirmed("m1"));

        let items = fx.timeline.get("g1");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, MessageId::confirmed("m1"));
        assert_eq!(items[0].content, "hi");
        assert_eq!(
            fx.unread.get("g1").last_read_message.map(|m| m.id),
            Some(MessageId::confirmed("m1"))
        );
    }

    #[tokio::test]
    async fn failed_send_removes_only_its_placeholder() {
        let fx = fixture();
        fx.timeline.upsert(
            "g1",
            normalize_message(&wire("m0", "earlier", "2024-01-01T00:00:00Z"), "g1"),
        );
        let before = fx.timeline.get("g1");
        fx.transport.fail_next(
            TransportOp::SendMessage,
            TransportError::network("connection reset"),
        );

        let err = fx
            .coordinator
            .send("g1", "hi", MessageKind::Text, None)
            .await
            .expect_err("send should fail");

        assert_eq!(err.code(), "network_error");
        assert_eq!(err.category(), TransportErrorCategory::Network);
        assert_eq!(fx.timeline.get("g1"), before);
        assert!(fx.unread.get("g1").last_read_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_send_leaves_no_placeholder() {
        let fx = fixture();
        fx.transport.gate(TransportOp::SendMessage);

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            fx.coordinator.send("g1", "hi", MessageKind::Text, None),
        )
        .await;

        assert!(attempt.is_err());
        assert!(fx.timeline.is_empty("g1"));
    }

    #[tokio::test]
    async fn sends_carry_kind_and_metadata() {
        let fx = fixture();
        let metadata = json!({ "itemId": "i-9", "action": "added" });

        let confirmed = fx
            .coordinator
            .send("g1", "Milk", MessageKind::ItemEvent, Some(metadata.clone()))
            .await
            .expect("send");

        assert_eq!(confirmed.kind, MessageKind::ItemEvent);
        assert_eq!(confirmed.metadata, Some(metadata));
        assert_eq!(confirmed.sender_id, "u-alice");
    }

    #[tokio::test]
    async fn loads_history_in_created_order() {
        let fx = fixture();
        fx.transport.seed_history(
            "g1",
            vec![
                wire("m2", "second", "2024-01-01T00:00:02Z"),
                wire("m1", "first", "2024-01-01T00:00:01Z"),
            ],
        );

        let count = fx.coordinator.load_history("g1").await.expect("history");
        assert_eq!(count, 2);
        let ids: Vec<_> = fx
            .timeline
            .get("g1")
            .into_iter()
            .map(|m| m.id.as_str().to_owned())
            .collect();
        assert_eq!(ids, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn failed_history_load_leaves_cache_untouched() {
        let fx = fixture();
        fx.transport.fail_next(
            TransportOp::FetchHistory,
            TransportError::new(TransportErrorCategory::Auth, "unauthorized", "token expired"),
        );

        let err = fx.coordinator.load_history("g1").await.expect_err("history");
        assert_eq!(err.code(), "unauthorized");
        assert!(fx.timeline.is_empty("g1"));
    }

    #[tokio::test]
    async fn edit_and_delete_update_the_timeline() {
        let fx = fixture();
        let sent = fx
            .coordinator
            .send("g1", "helo", MessageKind::Text, None)
            .await
            .expect("send");

        let edited = fx
            .coordinator
            .edit("g1", sent.id.as_str(), "hello")
            .await
            .expect("edit");
        assert_eq!(edited.content, "hello");
        assert!(edited.edited_at.is_some());
        let stored = fx.timeline.find("g1", "m1").expect("stored");
        assert_eq!(stored.content, "hello");
        assert!(stored.is_read_by("u-alice"));

        fx.coordinator.delete("g1", "m1").await.expect("delete");
        assert!(fx.timeline.find("g1", "m1").expect("stored").deleted);
        assert_eq!(fx.timeline.len("g1"), 1);
    }

    #[tokio::test]
    async fn editing_unknown_message_is_rejected() {
        let fx = fixture();
        let err = fx
            .coordinator
            .edit("g1", "nope", "text")
            .await
            .expect_err("edit");
        assert_eq!(err.category(), TransportErrorCategory::Rejected);
        assert!(fx.timeline.is_empty("g1"));
    }

    #[tokio::test]
    async fn loads_unread_snapshot() {
        let fx = fixture();
        fx.transport.seed_unread(
            "g1",
            WireUnreadInfo {
                unread_count: 4,
                last_read_message: Some(wire("m3", "seen", "2024-01-01T00:00:03Z")),
            },
        );

        let info = fx.coordinator.load_unread("g1").await.expect("unread");
        assert_eq!(info.unread_count, 4);
        assert_eq!(fx.unread.get("g1"), info);
        assert_eq!(
            info.last_read_message.map(|m| m.id),
            Some(MessageId::confirmed("m3"))
        );
    }

    #[tokio::test]
    async fn fetches_leave_local_state_untouched() {
        let fx = fixture();
        fx.transport.seed_history(
            "g1",
            vec![wire("m1", "first", "2024-01-01T00:00:01Z")],
        );
        fx.transport.seed_unread(
            "g1",
            WireUnreadInfo {
                unread_count: 2,
                last_read_message: None,
            },
        );

        let messages = fx.coordinator.fetch_history("g1").await.expect("history");
        let info = fx.coordinator.fetch_unread("g1").await.expect("unread");

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].group_id, "g1");
        assert_eq!(info.unread_count, 2);
        assert!(fx.timeline.is_empty("g1"));
        assert_eq!(fx.unread.get("g1"), UnreadInfo::default());
    }
}
