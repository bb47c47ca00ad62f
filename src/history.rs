//! Bounded in-memory history of processed notifications and action outcomes.
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use crate::model::{Notification, Server};

pub const DEFAULT_MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Playback,
    Watched,
    Webhook,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Received,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: Server,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_title: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub processing_ms: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl HistoryEvent {
    pub fn new(event_type: EventType, source: Server, status: Status) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            source,
            username: String::new(),
            media_id: String::new(),
            media_title: None,
            status,
            error_message: None,
            details: Map::new(),
            processing_ms: 0,
        }
    }

    /// Event describing a typed notification, with its playback/watched
    /// fields copied into `details`.
    pub fn from_notification(notification: &Notification, status: Status) -> Self {
        let meta = notification.metadata();
        let event_type = match notification {
            Notification::Playback(_) => EventType::Playback,
            Notification::Watched(_) => EventType::Watched,
        };
        let mut event = Self::new(event_type, meta.server, status)
            .with_user(&meta.username)
            .with_media(&meta.media_id, meta.title.as_deref());
        match notification {
            Notification::Playback(n) => {
                event = event
                    .with_detail("playing", n.playing)
                    .with_detail("position", format!("{:?}", n.position))
                    .with_detail("runtime", format!("{:?}", n.runtime));
            }
            Notification::Watched(n) => {
                event = event
                    .with_detail("watched", n.watched)
                    .with_detail("runtime", format!("{:?}", n.runtime));
            }
        }
        event
    }

    pub fn with_user(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    pub fn with_media(mut self, media_id: &str, title: Option<&str>) -> Self {
        self.media_id = media_id.to_string();
        self.media_title = title.map(str::to_string);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_ms = elapsed.as_millis() as u64;
        self
    }
}

/// Fixed-size ring of [`HistoryEvent`]s; the oldest entry is overwritten
/// once the store is full.
#[derive(Debug)]
pub struct HistoryStore {
    events: RwLock<VecDeque<HistoryEvent>>,
    capacity: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl HistoryStore {
    /// A capacity of zero falls back to [`DEFAULT_MAX_EVENTS`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_MAX_EVENTS
        } else {
            capacity
        };
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add(&self, event: HistoryEvent) {
        let mut events = self.events.write();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// All stored events, newest first.
    pub fn get_all(&self) -> Vec<HistoryEvent> {
        self.events.read().iter().rev().cloned().collect()
    }

    /// The `n` newest events; everything when `n` is zero or exceeds the count.
    pub fn get_latest(&self, n: usize) -> Vec<HistoryEvent> {
        let events = self.events.read();
        let take = if n == 0 { events.len() } else { n };
        events.iter().rev().take(take).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}
