//! Plex webhook adapter. Plex posts `multipart/form-data` with the JSON
//! document in a `payload` field; raw JSON bodies are accepted as well.
use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Map;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::AppState;
use crate::history::{EventType, HistoryEvent, Status};
use crate::model::{
    Notification, NotificationMetadata, PlaybackNotification, Server, WatchedNotification,
};

const IMDB_PREFIX: &str = "imdb://";

#[derive(Debug, Default, Deserialize)]
pub struct PlexPayload {
    pub event: String,
    #[serde(rename = "Account", default)]
    pub account: PlexAccount,
    #[serde(rename = "Server", default)]
    pub server: PlexServer,
    #[serde(rename = "Metadata", default)]
    pub metadata: PlexMetadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlexAccount {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlexServer {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlexMetadata {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "Guid", default)]
    pub guids: Vec<PlexGuid>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: i64,
    /// Milliseconds.
    #[serde(rename = "viewOffset", default)]
    pub view_offset: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlexGuid {
    pub id: String,
}

/// First IMDb id among the item's external guids.
pub fn parse_imdb_id(guids: &[PlexGuid]) -> Option<String> {
    guids.iter().find_map(|g| {
        g.id.strip_prefix(IMDB_PREFIX)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    })
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Build the typed notification for a Plex event. `Ok(None)` means the item
/// is not a movie with an IMDb id and should be ignored.
pub fn to_notification(payload: &PlexPayload) -> Result<Option<Notification>> {
    if payload.metadata.kind != "movie" {
        return Ok(None);
    }
    let Some(media_id) = parse_imdb_id(&payload.metadata.guids) else {
        return Ok(None);
    };

    // Plex payloads carry no event time.
    let metadata = NotificationMetadata {
        server: Server::Plex,
        username: payload.account.title.clone(),
        media_id,
        title: Some(payload.metadata.title.clone()).filter(|t| !t.is_empty()),
        time: Utc::now(),
    };
    let runtime = millis(payload.metadata.duration);
    let position = millis(payload.metadata.view_offset);

    let notification = match payload.event.as_str() {
        "media.scrobble" => Notification::Watched(WatchedNotification {
            metadata,
            watched: true,
            runtime,
        }),
        "media.play" | "media.resume" => Notification::Playback(PlaybackNotification {
            metadata,
            playing: true,
            position,
            runtime,
        }),
        "media.pause" | "media.stop" => Notification::Playback(PlaybackNotification {
            metadata,
            playing: false,
            position,
            runtime,
        }),
        other => return Err(anyhow!("unsupported plex event '{}'", other)),
    };
    Ok(Some(notification))
}

async fn read_payload(state: &AppState, request: Request) -> Result<PlexPayload> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if is_multipart {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| anyhow!("invalid multipart body: {}", err))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .context("failed to read multipart field")?
        {
            if field.name() == Some("payload") {
                let text = field.text().await.context("failed to read payload field")?;
                debug!(raw_payload = %text, "received plex webhook payload");
                return serde_json::from_str(&text).context("invalid plex payload JSON");
            }
        }
        return Err(anyhow!("no payload field in form data"));
    }

    let body = Bytes::from_request(request, state)
        .await
        .map_err(|err| anyhow!("failed to read body: {}", err))?;
    debug!(raw_payload = %String::from_utf8_lossy(&body), "received plex webhook payload");
    serde_json::from_slice(&body).context("invalid plex payload JSON")
}

pub async fn webhook(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    state.metrics.track_webhook(Server::Plex.as_str());

    let payload = match read_payload(&state, request).await {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %format!("{:#}", err), "malformed plex webhook notification payload");
            state.history.add(
                HistoryEvent::new(EventType::Webhook, Server::Plex, Status::Error)
                    .with_error(format!("{:#}", err))
                    .with_processing_time(started.elapsed()),
            );
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let account_id = (payload.account.id != 0).then(|| payload.account.id.to_string());
    let linked = state
        .router
        .resolve(Server::Plex, account_id.as_deref(), &payload.account.title)
        .is_some();

    let notification = match to_notification(&payload) {
        Ok(Some(n)) => n,
        Ok(None) => return StatusCode::OK.into_response(),
        Err(_) if !linked => {
            debug!(
                user = %payload.account.title,
                account_id = account_id.as_deref().unwrap_or_default(),
                event = %payload.event,
                "no tracker account for plex user, ignoring webhook"
            );
            return StatusCode::OK.into_response();
        }
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let mut details = Map::new();
    details.insert("event".into(), payload.event.clone().into());
    if !payload.server.title.is_empty() {
        details.insert("server".into(), payload.server.title.clone().into());
    }
    state.dispatch(&notification, account_id.as_deref(), details)
}
