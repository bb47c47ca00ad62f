use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Media server a notification originated from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    Plex,
    Emby,
}

impl Server {
    pub fn as_str(&self) -> &'static str {
        match self {
            Server::Plex => "plex",
            Server::Emby => "emby",
        }
    }
}

/// Fields shared by every notification coming out of a webhook adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMetadata {
    pub server: Server,
    pub username: String,
    pub media_id: String,
    pub title: Option<String>,
    pub time: DateTime<Utc>,
}

/// Play, pause, resume or stop of a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackNotification {
    pub metadata: NotificationMetadata,
    pub playing: bool,
    pub position: Duration,
    pub runtime: Duration,
}

/// Scrobble or explicit played/unplayed toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedNotification {
    pub metadata: NotificationMetadata,
    pub watched: bool,
    pub runtime: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Playback(PlaybackNotification),
    Watched(WatchedNotification),
}

impl Notification {
    pub fn metadata(&self) -> &NotificationMetadata {
        match self {
            Notification::Playback(n) => &n.metadata,
            Notification::Watched(n) => &n.metadata,
        }
    }
}

/// What an action applies to and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub media_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source: Server,
    pub username: String,
    pub title: Option<String>,
}

impl ActionTarget {
    pub fn from_metadata(metadata: &NotificationMetadata) -> Self {
        Self {
            media_id: metadata.media_id.clone(),
            occurred_at: metadata.time,
            source: metadata.server,
            username: metadata.username.clone(),
            title: metadata.title.clone(),
        }
    }
}

/// Normalized operation against the tracker, the unit the debouncer and
/// worker operate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    MarkWatched(ActionTarget),
    MarkUnwatched(ActionTarget),
    LogWatched(ActionTarget),
}

impl Action {
    pub fn target(&self) -> &ActionTarget {
        match self {
            Action::MarkWatched(t) | Action::MarkUnwatched(t) | Action::LogWatched(t) => t,
        }
    }

    pub fn media_id(&self) -> &str {
        &self.target().media_id
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::MarkWatched(_) => "mark_watched",
            Action::MarkUnwatched(_) => "mark_unwatched",
            Action::LogWatched(_) => "log_watched",
        }
    }

    /// Human readable label used in log lines.
    pub fn describe(&self) -> &'static str {
        match self {
            Action::MarkWatched(_) => "mark film as watched",
            Action::MarkUnwatched(_) => "mark film as unwatched",
            Action::LogWatched(_) => "log film as watched",
        }
    }
}
