use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, TrackerAccount};
use crate::error::ActionError;
use crate::tracker::model::{DiaryRequest, LoginRequest, LoginResponse, WatchedRequest};

pub mod model;

/// Capability the worker drives to change a user's watch record. One
/// instance owns one account's session.
///
/// Implementations report failures as [`ActionError`] (wrapped in
/// `anyhow::Error`) so the retry engine can classify them.
#[async_trait]
pub trait ActionClient: Send + Sync {
    async fn login(&self) -> Result<()>;

    async fn set_watched(&self, media_id: &str, watched: bool) -> Result<()>;

    async fn log_watched(&self, media_id: &str, occurred_at: DateTime<Utc>) -> Result<()>;

    /// Whether a session is currently held. Reported on `/health`.
    fn connected(&self) -> bool {
        true
    }
}

/// JSON/HTTP client for the tracker service.
pub struct HttpTrackerClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
    session: Mutex<Option<String>>,
}

impl fmt::Debug for HttpTrackerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTrackerClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpTrackerClient {
    pub fn new(base_url: Url, username: String, password: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("watch-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build tracker HTTP client")?;
        Ok(Self {
            http,
            base_url,
            username,
            password,
            session: Mutex::new(None),
        })
    }

    pub fn from_config(cfg: &Config, account: &TrackerAccount) -> Result<Self> {
        let base_url = Url::parse(&cfg.tracker.base_url)
            .with_context(|| format!("invalid tracker.base_url '{}'", cfg.tracker.base_url))?;
        Self::new(
            base_url,
            account.username.clone(),
            account.password.clone(),
            Duration::from_secs(cfg.tracker.request_timeout_seconds),
        )
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn build_request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid tracker path '{}'", path))?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Accept", "application/json");
        if let Some(token) = self.session.lock().as_deref() {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build tracker request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let url = request.url().clone();
        let method = request.method().clone();
        debug!(%method, %url, "tracker request");
        let res = self.http.execute(request).await.map_err(|err| {
            classify_transport(&err)
                .with_context("url", url.as_str())
                .with_context("username", self.username.as_str())
        })?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            // Drop the session so the next action logs in again.
            self.session.lock().take();
        }
        let body = res.text().await.unwrap_or_default();
        warn!(%method, %url, %status, "tracker returned an error");
        Err(classify_status(status, &body)
            .with_context("url", url.as_str())
            .with_context("username", self.username.as_str())
            .into())
    }

    async fn ensure_session(&self) -> Result<()> {
        if self.has_session() {
            return Ok(());
        }
        self.login().await
    }
}

#[async_trait]
impl ActionClient for HttpTrackerClient {
    async fn login(&self) -> Result<()> {
        let body = LoginRequest {
            username: &self.username,
            password: &self.password,
            remember: true,
        };
        let request = self.build_request(Method::POST, "v1/session", Some(&body))?;
        let res = self.execute(request).await?;
        let payload: LoginResponse = res.json().await.map_err(|err| {
            ActionError::ui(anyhow!("invalid login response: {}", err))
                .with_context("username", self.username.as_str())
        })?;
        *self.session.lock() = Some(payload.token);
        info!(username = %self.username, "logged in to tracker");
        Ok(())
    }

    async fn set_watched(&self, media_id: &str, watched: bool) -> Result<()> {
        self.ensure_session().await?;
        let path = format!("v1/films/{}/watched", media_id);
        let request = self.build_request(Method::PUT, &path, Some(&WatchedRequest { watched }))?;
        self.execute(request).await?;
        info!(username = %self.username, media_id, watched, "updated watched flag");
        Ok(())
    }

    async fn log_watched(&self, media_id: &str, occurred_at: DateTime<Utc>) -> Result<()> {
        self.ensure_session().await?;
        let path = format!("v1/films/{}/diary", media_id);
        let body = DiaryRequest {
            watched_at: occurred_at,
        };
        let request = self.build_request(Method::POST, &path, Some(&body))?;
        self.execute(request).await?;
        info!(username = %self.username, media_id, "logged diary entry");
        Ok(())
    }

    fn connected(&self) -> bool {
        self.has_session()
    }
}

/// Map a non-success tracker response onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> ActionError {
    let cause = anyhow!("tracker error {}: {}", status, body);
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ActionError::auth(cause),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ActionError::timeout(cause),
        StatusCode::TOO_MANY_REQUESTS => ActionError::network(cause),
        s if s.is_server_error() => ActionError::network(cause),
        s if s.is_client_error() => ActionError::ui(cause),
        _ => ActionError::unknown(cause),
    };
    err.with_context("status", status.as_u16())
}

fn classify_transport(err: &reqwest::Error) -> ActionError {
    let cause = anyhow!("failed to reach tracker: {}", err);
    if err.is_timeout() {
        ActionError::timeout(cause)
    } else {
        ActionError::network(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn client() -> HttpTrackerClient {
        HttpTrackerClient::new(
            Url::parse("https://tracker.example/").unwrap(),
            "alice".into(),
            "secret".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn classify_status_maps_kinds() {
        let cases = [
            (StatusCode::UNAUTHORIZED, ErrorKind::Auth, false),
            (StatusCode::FORBIDDEN, ErrorKind::Auth, false),
            (StatusCode::REQUEST_TIMEOUT, ErrorKind::Timeout, true),
            (StatusCode::GATEWAY_TIMEOUT, ErrorKind::Timeout, true),
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::Network, true),
            (StatusCode::BAD_GATEWAY, ErrorKind::Network, true),
            (StatusCode::NOT_FOUND, ErrorKind::Ui, true),
            (StatusCode::MULTIPLE_CHOICES, ErrorKind::Unknown, false),
        ];
        for (status, kind, retryable) in cases {
            let err = classify_status(status, "body");
            assert_eq!(err.kind, kind, "{}", status);
            assert_eq!(err.retryable, retryable, "{}", status);
            assert_eq!(err.context["status"], json!(status.as_u16()));
        }
    }

    #[test]
    fn build_request_without_session() {
        let client = client();
        let request = client
            .build_request(Method::PUT, "v1/films/tt0133093/watched", Some(&WatchedRequest { watched: true }))
            .unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.url().path(), "/v1/films/tt0133093/watched");
        assert!(request.headers().get("Authorization").is_none());
        assert_eq!(
            request
                .headers()
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value, json!({ "watched": true }));
    }

    #[test]
    fn build_request_with_session_sets_bearer() {
        let client = client();
        assert!(!client.connected());
        *client.session.lock() = Some("tok".into());
        assert!(client.has_session());
        assert!(client.connected());
        let request = client
            .build_request::<()>(Method::POST, "v1/session", None)
            .unwrap();
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer tok"
        );
    }
}
