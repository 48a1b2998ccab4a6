use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved id prefix for locally synthesized placeholder messages.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Message identity, distinguishing unconfirmed placeholders from server ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    /// Local placeholder id (`temp-...`) awaiting reconciliation.
    Pending(String),
    /// Server-assigned id.
    Confirmed(String),
}

impl MessageId {
    /// Fresh placeholder id stamped with `now`.
    pub fn placeholder(now: DateTime<Utc>) -> Self {
        Self::Pending(format!(
            "{PLACEHOLDER_PREFIX}{}-{}",
            now.timestamp_millis(),
            Uuid::new_v4().simple()
        ))
    }

    /// Wrap a server id.
    pub fn confirmed(id: impl Into<String>) -> Self {
        Self::Confirmed(id.into())
    }

    /// Classify a raw id by its prefix.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with(PLACEHOLDER_PREFIX) {
            Self::Pending(raw)
        } else {
            Self::Confirmed(raw)
        }
    }

    /// The raw id, including the placeholder prefix if any.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending(id) | Self::Confirmed(id) => id,
        }
    }

    /// Whether this is a client-generated placeholder id.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message category as carried on the wire (`messageType`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Plain text chat message.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// Server-generated notice (member joined, group renamed, ...).
    System,
    /// Shopping item activity (added, checked, removed).
    ItemEvent,
    /// Shopping list activity (created, archived, ...).
    ListEvent,
}

impl MessageKind {
    /// Parse a wire kind, accepting both `item-event` and `item_event` spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "system" => Some(Self::System),
            "item-event" | "itemevent" => Some(Self::ItemEvent),
            "list-event" | "listevent" => Some(Self::ListEvent),
            _ => None,
        }
    }

    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::System => "system",
            Self::ItemEvent => "item-event",
            Self::ListEvent => "list-event",
        }
    }

    /// Structural kinds never take read receipts.
    pub fn is_structural(self) -> bool {
        matches!(self, Self::System | Self::ItemEvent | Self::ListEvent)
    }
}

/// Canonical message record stored in a group timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Placeholder or confirmed id.
    pub id: MessageId,
    /// Owning group.
    pub group_id: String,
    /// Author user id (`"system"` for server notices).
    pub sender_id: String,
    /// Author display name.
    pub sender_display: String,
    /// Message text.
    pub content: String,
    /// Message category.
    pub kind: MessageKind,
    /// Kind-specific payload, for example an item or list reference.
    pub metadata: Option<serde_json::Value>,
    /// Server send time; the timeline sort key.
    pub created_at: DateTime<Utc>,
    /// Last server-side modification.
    pub updated_at: DateTime<Utc>,
    /// Set once the content was edited.
    pub edited_at: Option<DateTime<Utc>>,
    /// Soft-deleted; the entry stays in place.
    pub deleted: bool,
    /// Readers; only ever grows.
    pub read_by: BTreeSet<String>,
}

impl Message {
    /// Whether the message still waits for the server.
    pub fn is_placeholder(&self) -> bool {
        self.id.is_pending()
    }

    /// Whether `user_id` sent the message.
    pub fn is_authored_by(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// Whether `user_id` has read the message.
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }
}

/// The local user on whose behalf the core acts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub display_name: String,
}

impl Actor {
    /// Build an actor from its user id and display name.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Unread bookkeeping for one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UnreadInfo {
    /// Messages not yet acknowledged by the actor.
    pub unread_count: u64,
    /// Last message the actor is known to have seen.
    pub last_read_message: Option<Message>,
}

/// Raw message payload as delivered by a transport.
///
/// Field names differ between history fetches and live events, so the payload
/// is kept as JSON and interpreted by [`crate::normalization`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct WireMessage(pub serde_json::Value);

impl From<serde_json::Value> for WireMessage {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl WireMessage {
    /// Top-level field of the raw payload.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

/// Response of `fetch_unread_info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WireUnreadInfo {
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub last_read_message: Option<WireMessage>,
}

/// Arguments of `send_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRequest {
    pub group_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Option<serde_json::Value>,
}

/// One pushed notification from the live-event feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveEvent {
    /// Group the message belongs to.
    pub group_id: String,
    /// Raw message payload.
    pub message: WireMessage,
}

/// Change notifications emitted to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// A group's timeline was mutated.
    TimelineChanged {
        /// Affected group.
        group_id: String,
    },
    /// A group's unread state changed.
    UnreadChanged {
        /// Affected group.
        group_id: String,
        /// Unread count after the change.
        unread_count: u64,
    },
}
