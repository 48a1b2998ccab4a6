use std::{
    collections::{BTreeSet, HashMap},
    mem,
    sync::Mutex,
};

use tracing::{debug, trace};

use crate::{
    channel::SyncNotifier,
    lock,
    types::{Message, SyncEvent},
};

const DEFAULT_MAX_ITEMS: usize = 1_200;

/// Result of [`TimelineCache::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The id was new and the message was inserted.
    Inserted,
    /// The id existed and the message was merged into it.
    Merged,
}

/// Result of reconciling a confirmed message against the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A placeholder was swapped for the confirmed message.
    ReplacedPlaceholder,
    /// The confirmed id was already present and was merged.
    Merged,
    /// No counterpart was found; the message was inserted as new.
    Inserted,
}

impl From<UpsertOutcome> for ReconcileOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Inserted => Self::Inserted,
            UpsertOutcome::Merged => Self::Merged,
        }
    }
}

/// Per-group ordered message collections.
///
/// Every group's timeline is sorted by `created_at` ascending (stable for
/// ties) and holds each id at most once after every operation. Operations take
/// a single lock and never await, so none can observe another half-applied.
#[derive(Debug)]
pub struct TimelineCache {
    groups: Mutex<HashMap<String, Vec<Message>>>,
    max_items: usize,
    notifier: SyncNotifier,
}

impl Default for TimelineCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS, SyncNotifier::default())
    }
}

impl TimelineCache {
    /// Create a cache retaining at most `max_items` (`>= 1`) per group.
    pub fn new(max_items: usize, notifier: SyncNotifier) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            max_items: max_items.max(1),
            notifier,
        }
    }

    /// Messages of a group in display order; empty for unknown groups.
    pub fn get(&self, group_id: &str) -> Vec<Message> {
        lock(&self.groups)
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// A copy of one message by id.
    pub fn find(&self, group_id: &str, message_id: &str) -> Option<Message> {
        lock(&self.groups)
            .get(group_id)?
            .iter()
            .find(|m| m.id.as_str() == message_id)
            .cloned()
    }

    /// Number of cached messages for the group.
    pub fn len(&self, group_id: &str) -> usize {
        lock(&self.groups).get(group_id).map_or(0, Vec::len)
    }

    /// Whether the group has no cached messages.
    pub fn is_empty(&self, group_id: &str) -> bool {
        self.len(group_id) == 0
    }

    /// Insert or merge a message by id.
    pub fn upsert(&self, group_id: &str, message: Message) -> UpsertOutcome {
        let outcome = {
            let mut groups = lock(&self.groups);
            let items = groups.entry(group_id.to_owned()).or_default();
            let outcome = upsert_in(items, message);
            self.trim(items);
            outcome
        };
        trace!(%group_id, ?outcome, "timeline upsert");
        self.changed(group_id);
        outcome
    }

    /// Merge a batch, for example a history load.
    pub fn upsert_many(&self, group_id: &str, messages: impl IntoIterator<Item = Message>) {
        let count = {
            let mut groups = lock(&self.groups);
            let items = groups.entry(group_id.to_owned()).or_default();
            let mut count = 0_usize;
            for message in messages {
                upsert_in(items, message);
                count += 1;
            }
            self.trim(items);
            count
        };
        debug!(%group_id, count, "timeline merged batch");
        self.changed(group_id);
    }

    /// Swap the placeholder `temp_id` for its confirmed message.
    ///
    /// Falls back to [`Self::upsert`] when the placeholder is already gone. If
    /// the confirmed id is present elsewhere (a live event won the race), the
    /// placeholder is dropped and the message is merged into that entry.
    pub fn replace_placeholder(
        &self,
        group_id: &str,
        temp_id: &str,
        message: Message,
    ) -> ReconcileOutcome {
        let outcome = {
            let mut groups = lock(&self.groups);
            let items = groups.entry(group_id.to_owned()).or_default();
            let placeholder = position_of(items, temp_id);
            let existing = position_of(items, message.id.as_str());

            match (placeholder, existing) {
                (Some(idx), None) => {
                    replace_at(items, idx, message);
                    ReconcileOutcome::ReplacedPlaceholder
                }
                (Some(idx), Some(_)) => {
                    let placeholder = items.remove(idx);
                    let mut message = message;
                    message.read_by.extend(placeholder.read_by);
                    upsert_in(items, message);
                    ReconcileOutcome::Merged
                }
                (None, _) => {
                    let outcome: ReconcileOutcome = upsert_in(items, message).into();
                    self.trim(items);
                    outcome
                }
            }
        };
        debug!(%group_id, %temp_id, ?outcome, "placeholder reconciled");
        self.changed(group_id);
        outcome
    }

    /// Merge a message delivered by the live feed.
    ///
    /// Known ids merge. Otherwise the first unreconciled placeholder with the
    /// same content and sender is replaced. Two rapid identical messages from
    /// one sender can pair up with the wrong placeholder; the content of both
    /// is identical so the visible timeline is unaffected.
    pub fn reconcile_live(&self, group_id: &str, message: Message) -> ReconcileOutcome {
        let outcome = {
            let mut groups = lock(&self.groups);
            let items = groups.entry(group_id.to_owned()).or_default();

            if position_of(items, message.id.as_str()).is_some() {
                upsert_in(items, message);
                ReconcileOutcome::Merged
            } else if let Some(idx) = items.iter().position(|m| {
                m.id.is_pending()
                    && m.content == message.content
                    && m.sender_id == message.sender_id
            }) {
                replace_at(items, idx, message);
                ReconcileOutcome::ReplacedPlaceholder
            } else {
                upsert_in(items, message);
                self.trim(items);
                ReconcileOutcome::Inserted
            }
        };
        trace!(%group_id, ?outcome, "live message reconciled");
        self.changed(group_id);
        outcome
    }

    /// Remove the entry with exactly this id.
    pub fn remove(&self, group_id: &str, message_id: &str) -> Option<Message> {
        let removed = {
            let mut groups = lock(&self.groups);
            let items = groups.get_mut(group_id)?;
            let idx = position_of(items, message_id)?;
            items.remove(idx)
        };
        debug!(%group_id, %message_id, "timeline entry removed");
        self.changed(group_id);
        Some(removed)
    }

    /// Add `reader_id` to `read_by` of every listed message; returns how many changed.
    pub fn mark_many_read(&self, group_id: &str, ids: &[String], reader_id: &str) -> usize {
        let changed = {
            let mut groups = lock(&self.groups);
            let Some(items) = groups.get_mut(group_id) else {
                return 0;
            };
            let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
            let mut changed = 0_usize;
            for message in items.iter_mut() {
                if wanted.contains(message.id.as_str())
                    && message.read_by.insert(reader_id.to_owned())
                {
                    changed += 1;
                }
            }
            changed
        };
        if changed > 0 {
            self.changed(group_id);
        }
        changed
    }

    /// Flag a message as deleted; returns whether it was found.
    pub fn mark_deleted(&self, group_id: &str, message_id: &str) -> bool {
        let found = {
            let mut groups = lock(&self.groups);
            groups
                .get_mut(group_id)
                .and_then(|items| items.iter_mut().find(|m| m.id.as_str() == message_id))
                .map(|message| {
                    message.deleted = true;
                    message.updated_at = chrono::Utc::now();
                })
                .is_some()
        };
        if found {
            self.changed(group_id);
        }
        found
    }

    /// Drop a group's timeline entirely.
    pub fn discard(&self, group_id: &str) -> bool {
        let removed = lock(&self.groups).remove(group_id).is_some();
        if removed {
            debug!(%group_id, "timeline discarded");
            self.changed(group_id);
        }
        removed
    }

    fn trim(&self, items: &mut Vec<Message>) {
        if items.len() <= self.max_items {
            return;
        }

        let excess = items.len() - self.max_items;
        items.drain(0..excess);
    }

    fn changed(&self, group_id: &str) {
        self.notifier.emit(SyncEvent::TimelineChanged {
            group_id: group_id.to_owned(),
        });
    }
}

fn position_of(items: &[Message], message_id: &str) -> Option<usize> {
    items.iter().position(|m| m.id.as_str() == message_id)
}

fn upsert_in(items: &mut Vec<Message>, message: Message) -> UpsertOutcome {
    if let Some(idx) = position_of(items, message.id.as_str()) {
        let existing = &mut items[idx];
        let read_by = mem::take(&mut existing.read_by);
        *existing = message;
        existing.read_by.extend(read_by);
        restore_order(items);
        UpsertOutcome::Merged
    } else {
        let idx = items.partition_point(|m| m.created_at <= message.created_at);
        items.insert(idx, message);
        UpsertOutcome::Inserted
    }
}

fn replace_at(items: &mut [Message], idx: usize, mut message: Message) {
    message.read_by.extend(mem::take(&mut items[idx].read_by));
    items[idx] = message;
    restore_order(items);
}

fn restore_order(items: &mut [Message]) {
    if !items.is_sorted_by_key(|m| m.created_at) {
        items.sort_by_key(|m| m.created_at);
    }
}
