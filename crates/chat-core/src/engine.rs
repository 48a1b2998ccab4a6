use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tracing::{debug, info};

use crate::{
    channel::{SyncEventStream, SyncNotifier},
    config::SyncConfig,
    coordinator::SendCoordinator,
    error::SyncError,
    listener::{LiveEventOutcome, LiveUpdateListener, ViewActivity},
    receipts::ReadReceiptBatcher,
    timeline::TimelineCache,
    transport::ChatTransport,
    lock,
    types::{Actor, LiveEvent, Message, MessageKind, UnreadInfo},
    unread::{MarkGroupRead, UnreadCounter, UnreadTransition},
};

/// One actor's synchronization state, owned by the embedding application.
///
/// Instances share nothing, so several can run side by side.
pub struct ChatSync<T> {
    transport: Arc<T>,
    config: SyncConfig,
    notifier: SyncNotifier,
    timeline: Arc<TimelineCache>,
    unread: Arc<UnreadCounter>,
    views: Arc<ViewActivity>,
    coordinator: SendCoordinator<T>,
    listener: LiveUpdateListener,
    receipts: ReadReceiptBatcher<T>,
    /// Current mount token per group; loads only apply under their own token.
    mounts: Mutex<HashMap<String, u64>>,
    next_mount: AtomicU64,
}

impl<T: ChatTransport> ChatSync<T> {
    /// Build every component for `actor` on top of `transport`.
    pub fn new(transport: Arc<T>, actor: Actor, config: SyncConfig) -> Self {
        let notifier = SyncNotifier::new(config.event_buffer);
        let timeline = Arc::new(TimelineCache::new(
            config.timeline_max_items,
            notifier.clone(),
        ));
        let unread = Arc::new(UnreadCounter::new(notifier.clone()));
        let views = Arc::new(ViewActivity::default());

        let coordinator = SendCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&timeline),
            Arc::clone(&unread),
            actor.clone(),
        );
        let listener = LiveUpdateListener::new(
            actor.clone(),
            Arc::clone(&timeline),
            Arc::clone(&unread),
            Arc::clone(&views),
            config.processed_event_capacity,
        );
        let receipts = ReadReceiptBatcher::new(
            Arc::clone(&transport),
            Arc::clone(&timeline),
            Arc::clone(&unread),
            actor,
            config.read_receipt_debounce,
        );

        Self {
            transport,
            config,
            notifier,
            timeline,
            unread,
            views,
            coordinator,
            listener,
            receipts,
            mounts: Mutex::new(HashMap::new()),
            next_mount: AtomicU64::new(1),
        }
    }

    /// Start following a group: subscribe to live events, then load history
    /// and unread info.
    ///
    /// The subscription stays in place when a load fails; the first error is
    /// returned. Loads that finish after the group was unmounted or mounted
    /// again are discarded.
    pub async fn mount_group(&self, group_id: &str) -> Result<(), SyncError> {
        let mount = self.next_mount.fetch_add(1, Ordering::Relaxed);
        lock(&self.mounts).insert(group_id.to_owned(), mount);
        self.listener
            .mount(group_id, self.transport.subscribe_live_events());

        let history = self.coordinator.fetch_history(group_id).await;
        let unread = self.coordinator.fetch_unread(group_id).await;

        let current = lock(&self.mounts).get(group_id) == Some(&mount);
        if current {
            if let Ok(messages) = &history {
                self.timeline.upsert_many(group_id, messages.iter().cloned());
            }
            if let Ok(info) = &unread {
                self.unread
                    .apply(group_id, UnreadTransition::Loaded(info.clone()));
            }
        } else {
            debug!(%group_id, mount, "group left while loading; results discarded");
        }

        let loaded = history?.len();
        let info = unread?;
        if current {
            info!(
                %group_id,
                messages = loaded,
                unread = info.unread_count,
                "group mounted"
            );
        }
        Ok(())
    }

    /// Stop following a group. Its timeline is kept.
    pub fn unmount_group(&self, group_id: &str) {
        lock(&self.mounts).remove(group_id);
        self.listener.unmount(group_id);
        self.receipts.cancel_group(group_id);
        self.unread.reset_group(group_id);
        self.views.set_active(group_id, false);
        info!(%group_id, "group unmounted");
    }

    /// Record whether the group's conversation view is on screen.
    pub fn set_view_active(&self, group_id: &str, active: bool) {
        self.views.set_active(group_id, active);
    }

    /// Whether live events for the group are being followed.
    pub fn is_mounted(&self, group_id: &str) -> bool {
        self.listener.is_mounted(group_id)
    }

    /// Messages of a group in display order.
    pub fn timeline(&self, group_id: &str) -> Vec<Message> {
        self.timeline.get(group_id)
    }

    /// The group's current unread state.
    pub fn unread(&self, group_id: &str) -> UnreadInfo {
        self.unread.get(group_id)
    }

    /// Send a message with an optimistic placeholder.
    pub async fn send(
        &self,
        group_id: &str,
        content: &str,
        kind: MessageKind,
        metadata: Option<Value>,
    ) -> Result<Message, SyncError> {
        self.coordinator
            .send(group_id, content, kind, metadata)
            .await
    }

    /// Replace a message's content once the server accepts the edit.
    pub async fn edit(
        &self,
        group_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, SyncError> {
        self.coordinator.edit(group_id, message_id, content).await
    }

    /// Delete a message on the server and flag it in the timeline.
    pub async fn delete(&self, group_id: &str, message_id: &str) -> Result<(), SyncError> {
        self.coordinator.delete(group_id, message_id).await
    }

    /// Report messages that became visible; returns how many were queued
    /// for a read receipt.
    pub fn observe_visible<'a>(
        &self,
        group_id: &str,
        message_ids: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        let queued = message_ids
            .into_iter()
            .filter(|message_id| self.receipts.observe(group_id, message_id))
            .count();
        if queued > 0 {
            debug!(%group_id, queued, "visible messages observed");
        }
        queued
    }

    /// Mark the whole group read; at most one request runs per group.
    pub async fn mark_group_read(&self, group_id: &str) -> MarkGroupRead {
        self.unread
            .mark_group_read(self.transport.as_ref(), group_id)
            .await
    }

    /// Apply one live event directly, bypassing group subscriptions.
    pub fn handle_live_event(&self, event: &LiveEvent) -> LiveEventOutcome {
        self.listener.handle_event(event)
    }

    /// Change notifications for the presentation layer.
    pub fn subscribe(&self) -> SyncEventStream {
        self.notifier.subscribe()
    }

    /// Drop a group's cached timeline so the next mount reloads it.
    pub fn discard_timeline(&self, group_id: &str) -> bool {
        self.timeline.discard(group_id)
    }

    /// The transport every component talks to.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The signed-in identity.
    pub fn actor(&self) -> &Actor {
        self.coordinator.actor()
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The shared timeline cache.
    pub fn timeline_cache(&self) -> &Arc<TimelineCache> {
        &self.timeline
    }

    /// The shared unread counter.
    pub fn unread_counter(&self) -> &Arc<UnreadCounter> {
        &self.unread
    }

    /// Which groups have an active view.
    pub fn views(&self) -> &Arc<ViewActivity> {
        &self.views
    }

    /// The send coordinator.
    pub fn coordinator(&self) -> &SendCoordinator<T> {
        &self.coordinator
    }

    /// The live update listener.
    pub fn listener(&self) -> &LiveUpdateListener {
        &self.listener
    }

    /// The read receipt batcher.
    pub fn receipts(&self) -> &ReadReceiptBatcher<T> {
        &self.receipts
    }
}

impl<T> Drop for ChatSync<T> {
    fn drop(&mut self) {
        self.listener.unmount_all();
        self.receipts.cancel_all();
    }
}
