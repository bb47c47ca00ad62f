//! HTTP surface: webhook adapters plus read-only inspection endpoints.
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::history::{HistoryEvent, HistoryStore};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::model::Notification;
use crate::relay::Relay;
use crate::router::{Dispatch, Router as NotificationRouter};
use crate::worker::WorkerState;

pub mod emby;
pub mod plex;

const DEFAULT_EVENTS_LIMIT: usize = 25;

/// Shared handler context.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<NotificationRouter>,
    pub history: Arc<HistoryStore>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn from_relay(relay: &Relay) -> Self {
        Self {
            router: relay.router().clone(),
            history: relay.history().clone(),
            metrics: relay.metrics().clone(),
        }
    }

    /// Hand a typed notification to the pipeline and map the outcome onto an
    /// HTTP status.
    pub(crate) fn dispatch(
        &self,
        notification: &Notification,
        account_id: Option<&str>,
        details: Map<String, Value>,
    ) -> Response {
        match self.router.dispatch_with_details(notification, account_id, details) {
            Ok(Dispatch::Queued(_)) | Ok(Dispatch::NoAction) | Ok(Dispatch::Unmatched) => {
                StatusCode::OK.into_response()
            }
            Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/metrics", get(metrics))
        .route("/plex/webhook", post(plex::webhook))
        .route("/emby/webhook", post(emby::webhook))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "Welcome to watch-relay!"
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub username: String,
    pub connected: bool,
    pub state: WorkerState,
    pub queued: usize,
    pub debouncing: usize,
    pub in_flight: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok`, or `warning` while any tracker session is down.
    pub status: String,
    pub uptime_seconds: u64,
    pub start_time: DateTime<Utc>,
    pub workers: Vec<WorkerStatus>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers: Vec<WorkerStatus> = state
        .router
        .workers()
        .into_iter()
        .map(|w| WorkerStatus {
            username: w.username().to_string(),
            connected: w.connected(),
            state: w.state(),
            queued: w.queued(),
            debouncing: w.debouncing(),
            in_flight: w.in_flight(),
        })
        .collect();
    let status = if workers.iter().all(|w| w.connected) {
        "ok"
    } else {
        "warning"
    };
    Json(HealthResponse {
        status: status.into(),
        uptime_seconds: state.metrics.uptime().as_secs(),
        start_time: state.metrics.started_at(),
        workers,
    })
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub total: usize,
    pub limit: usize,
    pub events: Vec<HistoryEvent>,
}

/// Parse the `limit` query parameter; missing, invalid or zero means the default.
fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
}

async fn events(State(state): State<AppState>, Query(query): Query<EventsQuery>) -> Json<EventsResponse> {
    let limit = parse_limit(query.limit.as_deref());
    let events = state.history.get_latest(limit);
    Json(EventsResponse {
        total: events.len(),
        limit,
        events,
    })
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Requests that matched no route share one bucket so arbitrary URLs cannot
/// grow the per-path map.
pub const UNMATCHED_PATH: &str = "unmatched";

async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_PATH.to_string());
    let started = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .track_request(&path, response.status().as_u16(), started.elapsed());
    response
}
