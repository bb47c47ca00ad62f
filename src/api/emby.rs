//! Emby webhook adapter (JSON body).
use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Map;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::AppState;
use crate::model::{
    Notification, NotificationMetadata, PlaybackNotification, Server, WatchedNotification,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmbyPayload {
    pub event: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: EmbyUser,
    #[serde(default)]
    pub item: EmbyItem,
    #[serde(default)]
    pub playback_info: EmbyPlaybackInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmbyUser {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmbyItem {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub kind: String,
    /// 100ns ticks.
    #[serde(default)]
    pub run_time_ticks: i64,
    #[serde(default)]
    pub provider_ids: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmbyPlaybackInfo {
    /// 100ns ticks.
    #[serde(default)]
    pub position_ticks: i64,
}

fn ticks(t: i64) -> Duration {
    Duration::from_nanos((t.max(0) as u64).saturating_mul(100))
}

fn imdb_id(item: &EmbyItem) -> Option<String> {
    item.provider_ids
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("imdb"))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Build the typed notification for an Emby event. `Ok(None)` means the item
/// is not a movie with an IMDb id.
pub fn to_notification(payload: &EmbyPayload) -> Result<Option<Notification>> {
    if !payload.item.kind.eq_ignore_ascii_case("movie") {
        return Ok(None);
    }
    let Some(media_id) = imdb_id(&payload.item) else {
        return Ok(None);
    };

    let metadata = NotificationMetadata {
        server: Server::Emby,
        username: payload.user.name.clone(),
        media_id,
        title: Some(payload.item.name.clone()).filter(|t| !t.is_empty()),
        time: payload.date.unwrap_or_else(Utc::now),
    };
    let runtime = ticks(payload.item.run_time_ticks);
    let position = ticks(payload.playback_info.position_ticks);

    let playback = |metadata, playing| {
        Notification::Playback(PlaybackNotification {
            metadata,
            playing,
            position,
            runtime,
        })
    };
    let watched = |metadata, watched| {
        Notification::Watched(WatchedNotification {
            metadata,
            watched,
            runtime,
        })
    };

    let notification = match payload.event.as_str() {
        "playback.start" | "playback.unpause" => playback(metadata, true),
        "playback.pause" | "playback.stop" => playback(metadata, false),
        "item.markplayed" => watched(metadata, true),
        "item.markunplayed" => watched(metadata, false),
        other => return Err(anyhow!("unsupported emby event '{}'", other)),
    };
    Ok(Some(notification))
}

pub async fn webhook(State(state): State<AppState>, Json(payload): Json<EmbyPayload>) -> Response {
    state.metrics.track_webhook(Server::Emby.as_str());
    let linked = state
        .router
        .resolve(Server::Emby, None, &payload.user.name)
        .is_some();
    match to_notification(&payload) {
        Ok(Some(notification)) => {
            let mut details = Map::new();
            details.insert("event".into(), payload.event.clone().into());
            state.dispatch(&notification, None, details)
        }
        Ok(None) => StatusCode::OK.into_response(),
        Err(_) if !linked => {
            debug!(user = %payload.user.name, event = %payload.event, "no tracker account for emby user, ignoring webhook");
            StatusCode::OK.into_response()
        }
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}
