//! Environment-backed runtime tuning for the sync core.

use std::{env, time::Duration};

use thiserror::Error;

const DEFAULT_READ_RECEIPT_DEBOUNCE_MS: u64 = 1_000;
const DEFAULT_PROCESSED_EVENT_CAPACITY: usize = 500;
const DEFAULT_TIMELINE_MAX_ITEMS: usize = 1_200;
const DEFAULT_EVENT_BUFFER: usize = 256;

const READ_RECEIPT_DEBOUNCE_KEY: &str = "CHAT_SYNC_READ_RECEIPT_DEBOUNCE_MS";
const PROCESSED_EVENT_CAPACITY_KEY: &str = "CHAT_SYNC_PROCESSED_EVENT_CAPACITY";
const TIMELINE_MAX_ITEMS_KEY: &str = "CHAT_SYNC_TIMELINE_MAX_ITEMS";
const EVENT_BUFFER_KEY: &str = "CHAT_SYNC_EVENT_BUFFER";

/// Runtime configuration of a [`crate::ChatSync`] instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last observation before receipts are flushed.
    pub read_receipt_debounce: Duration,
    /// How many live-event ids are remembered for dedup.
    pub processed_event_capacity: usize,
    /// Per-group timeline retention cap.
    pub timeline_max_items: usize,
    /// Capacity of the change-notification channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_receipt_debounce: Duration::from_millis(DEFAULT_READ_RECEIPT_DEBOUNCE_MS),
            processed_event_capacity: DEFAULT_PROCESSED_EVENT_CAPACITY,
            timeline_max_items: DEFAULT_TIMELINE_MAX_ITEMS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through `lookup`; missing keys keep their defaults.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let debounce_ms = parse_positive(
            READ_RECEIPT_DEBOUNCE_KEY,
            DEFAULT_READ_RECEIPT_DEBOUNCE_MS,
            &mut lookup,
        )?;
        let processed_event_capacity = parse_positive(
            PROCESSED_EVENT_CAPACITY_KEY,
            DEFAULT_PROCESSED_EVENT_CAPACITY,
            &mut lookup,
        )?;
        let timeline_max_items =
            parse_positive(TIMELINE_MAX_ITEMS_KEY, DEFAULT_TIMELINE_MAX_ITEMS, &mut lookup)?;
        let event_buffer = parse_positive(EVENT_BUFFER_KEY, DEFAULT_EVENT_BUFFER, &mut lookup)?;

        Ok(Self {
            read_receipt_debounce: Duration::from_millis(debounce_ms),
            processed_event_capacity,
            timeline_max_items,
            event_buffer,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_positive<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(default);
    }

    let parsed = value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
        reason: err.to_string(),
    })?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(parsed)
}
