//! Conversion of heterogeneous wire payloads into canonical [`Message`]s.
//!
//! History fetches and live events disagree on field names (`_id` vs `id`,
//! `messageType` vs `type`, nested vs flat sender). Everything here is total:
//! malformed fields fall back to defaults instead of failing.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{
    Message, MessageId, MessageKind, UnreadInfo, WireMessage, WireUnreadInfo,
};

/// Sender id and display name used when a payload names no sender.
pub const SYSTEM_SENDER: &str = "system";

/// Normalize a wire message using the current time for missing timestamps.
pub fn normalize_message(wire: &WireMessage, fallback_group_id: &str) -> Message {
    normalize_message_at(wire, fallback_group_id, Utc::now())
}

/// Normalize a wire message, substituting `now` for missing timestamps.
pub fn normalize_message_at(
    wire: &WireMessage,
    fallback_group_id: &str,
    now: DateTime<Utc>,
) -> Message {
    let id = wire_message_id(wire)
        .map(MessageId::from_raw)
        .unwrap_or_else(|| MessageId::confirmed(format!("local-{}", Uuid::new_v4().simple())));

    let created_at = wire
        .field("createdAt")
        .and_then(parse_timestamp)
        .or_else(|| wire.field("timestamp").and_then(parse_timestamp))
        .unwrap_or(now);
    let updated_at = wire
        .field("updatedAt")
        .and_then(parse_timestamp)
        .unwrap_or(now);
    let edited_at = wire
        .field("editedAt")
        .and_then(parse_timestamp)
        .or_else(|| is_truthy(wire.field("isEdited")).then_some(updated_at));

    let kind = wire
        .field("messageType")
        .and_then(Value::as_str)
        .and_then(MessageKind::parse)
        .or_else(|| {
            wire.field("type")
                .and_then(Value::as_str)
                .and_then(MessageKind::parse)
        })
        .unwrap_or_default();

    let metadata = wire
        .field("metadata")
        .filter(|value| value.is_object() || value.is_array())
        .cloned();

    Message {
        id,
        group_id: group_id(wire).unwrap_or_else(|| fallback_group_id.to_owned()),
        sender_id: sender_id(wire).unwrap_or_else(|| SYSTEM_SENDER.to_owned()),
        sender_display: sender_display(wire).unwrap_or_else(|| SYSTEM_SENDER.to_owned()),
        content: wire.field("content").and_then(coerce_string).unwrap_or_default(),
        kind,
        metadata,
        created_at,
        updated_at,
        edited_at,
        deleted: is_truthy(wire.field("isDeleted")),
        read_by: read_by(wire.field("readBy")),
    }
}

/// Extract the message id (`id` or `_id`) without normalizing the rest.
pub fn wire_message_id(wire: &WireMessage) -> Option<String> {
    wire.field("id")
        .and_then(coerce_string)
        .or_else(|| wire.field("_id").and_then(coerce_string))
        .filter(|id| !id.trim().is_empty())
}

/// Normalize a `fetch_unread_info` response.
pub fn normalize_unread_info(wire: &WireUnreadInfo, group_id: &str) -> UnreadInfo {
    UnreadInfo {
        unread_count: wire.unread_count,
        last_read_message: wire
            .last_read_message
            .as_ref()
            .filter(|message| message.0.is_object())
            .map(|message| normalize_message(message, group_id)),
    }
}

fn group_id(wire: &WireMessage) -> Option<String> {
    wire.field("groupId")
        .and_then(coerce_string)
        .or_else(|| wire.field("group").and_then(object_id))
}

fn sender_id(wire: &WireMessage) -> Option<String> {
    wire.field("sender")
        .and_then(object_id)
        .or_else(|| wire.field("senderId").and_then(coerce_string))
}

fn sender_display(wire: &WireMessage) -> Option<String> {
    wire.field("sender")
        .and_then(|sender| sender.get("firstName"))
        .and_then(coerce_string)
        .or_else(|| wire.field("senderName").and_then(coerce_string))
}

/// Accept either a bare id or an object carrying `_id`/`id`.
fn object_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get("_id")
            .and_then(coerce_string)
            .or_else(|| map.get("id").and_then(coerce_string)),
        other => coerce_string(other),
    }
}

fn read_by(value: Option<&Value>) -> BTreeSet<String> {
    let Some(Value::Array(entries)) = value else {
        return BTreeSet::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::Object(map) => map
                .get("user")
                .and_then(object_id)
                .or_else(|| object_id(entry)),
            other => coerce_string(other),
        })
        .collect()
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
        _ => false,
    }
}

/// RFC 3339 strings, numeric strings and numbers (unix millis).
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
