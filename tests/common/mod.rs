#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use watch_relay::model::{
    Action, ActionTarget, Notification, NotificationMetadata, PlaybackNotification, Server,
    WatchedNotification,
};
use watch_relay::tracker::ActionClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Login,
    SetWatched(String, bool),
    LogWatched(String),
}

/// Tracker double: pops scripted results (Ok when exhausted) and records
/// every call.
#[derive(Clone, Default)]
pub struct RecordingClient {
    login_responses: Arc<Mutex<VecDeque<Result<()>>>>,
    action_responses: Arc<Mutex<VecDeque<Result<()>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    disconnected: Arc<AtomicBool>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            action_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn with_login_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            login_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    /// Calls other than logins.
    pub async fn actions(&self) -> Vec<Call> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| **c != Call::Login)
            .cloned()
            .collect()
    }

    async fn record(&self, call: Call, responses: &Mutex<VecDeque<Result<()>>>) -> Result<()> {
        self.calls.lock().await.push(call);
        responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait::async_trait]
impl ActionClient for RecordingClient {
    fn connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn login(&self) -> Result<()> {
        self.record(Call::Login, &self.login_responses).await
    }

    async fn set_watched(&self, media_id: &str, watched: bool) -> Result<()> {
        self.record(
            Call::SetWatched(media_id.to_string(), watched),
            &self.action_responses,
        )
        .await
    }

    async fn log_watched(&self, media_id: &str, _watched_at: DateTime<Utc>) -> Result<()> {
        self.record(Call::LogWatched(media_id.to_string()), &self.action_responses)
            .await
    }
}

pub fn metadata(server: Server, username: &str, media_id: &str) -> NotificationMetadata {
    NotificationMetadata {
        server,
        username: username.to_string(),
        media_id: media_id.to_string(),
        title: Some("The Matrix".into()),
        time: Utc::now(),
    }
}

pub fn watched(server: Server, username: &str, media_id: &str, watched: bool) -> Notification {
    Notification::Watched(WatchedNotification {
        metadata: metadata(server, username, media_id),
        watched,
        runtime: Duration::from_secs(8160),
    })
}

pub fn paused_at(server: Server, username: &str, media_id: &str, position_secs: u64) -> Notification {
    Notification::Playback(PlaybackNotification {
        metadata: metadata(server, username, media_id),
        playing: false,
        position: Duration::from_secs(position_secs),
        runtime: Duration::from_secs(100),
    })
}

pub fn target(media_id: &str) -> ActionTarget {
    ActionTarget::from_metadata(&metadata(Server::Plex, "alice", media_id))
}

pub fn mark_watched(media_id: &str) -> Action {
    Action::MarkWatched(target(media_id))
}

pub fn mark_unwatched(media_id: &str) -> Action {
    Action::MarkUnwatched(target(media_id))
}

/// Poll `check` under (possibly paused) tokio time until it holds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..2_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}
