//! Routing of typed notifications to the owning account's worker.
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::history::{HistoryEvent, HistoryStore, Status};
use crate::model::{
    Action, ActionTarget, Notification, PlaybackNotification, Server, WatchedNotification,
};
use crate::worker::WorkerHandle;

pub const DEFAULT_COMPLETION_THRESHOLD: f64 = 0.9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("notification has no media id")]
    MissingMediaId,
}

/// How a user's notifications turn into tracker actions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslationPolicy {
    /// Log a diary entry instead of toggling the watched flag.
    pub log_films: bool,
    /// Fraction of the runtime a paused or stopped playback must have reached
    /// to count as watched.
    pub completion_threshold: f64,
}

impl Default for TranslationPolicy {
    fn default() -> Self {
        Self {
            log_films: false,
            completion_threshold: DEFAULT_COMPLETION_THRESHOLD,
        }
    }
}

impl TranslationPolicy {
    pub fn translate(&self, notification: &Notification) -> Result<Option<Action>, TranslateError> {
        if notification.metadata().media_id.trim().is_empty() {
            return Err(TranslateError::MissingMediaId);
        }
        Ok(match notification {
            Notification::Watched(n) => Some(self.translate_watched(n)),
            Notification::Playback(n) => self.translate_playback(n),
        })
    }

    fn translate_watched(&self, n: &WatchedNotification) -> Action {
        let target = ActionTarget::from_metadata(&n.metadata);
        if n.watched {
            self.watched_action(target)
        } else {
            Action::MarkUnwatched(target)
        }
    }

    fn translate_playback(&self, n: &PlaybackNotification) -> Option<Action> {
        if n.playing || !self.is_complete(n) {
            return None;
        }
        Some(self.watched_action(ActionTarget::from_metadata(&n.metadata)))
    }

    /// Position reached the completion threshold of a known runtime.
    pub fn is_complete(&self, n: &PlaybackNotification) -> bool {
        if n.runtime.is_zero() {
            return false;
        }
        n.position.as_secs_f64() / n.runtime.as_secs_f64() >= self.completion_threshold
    }

    fn watched_action(&self, target: ActionTarget) -> Action {
        if self.log_films {
            Action::LogWatched(target)
        } else {
            Action::MarkWatched(target)
        }
    }
}

/// One configured media-server user bound to a tracker worker.
#[derive(Debug, Clone)]
pub struct Processor {
    worker: WorkerHandle,
    policy: TranslationPolicy,
}

impl Processor {
    pub fn new(worker: WorkerHandle, policy: TranslationPolicy) -> Self {
        Self { worker, policy }
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn policy(&self) -> &TranslationPolicy {
        &self.policy
    }

    /// Translate and hand the action to the worker's debouncer.
    pub fn process(&self, notification: &Notification) -> Result<Option<Action>, TranslateError> {
        let action = self.policy.translate(notification)?;
        if let Some(action) = &action {
            self.worker.submit(action.clone());
        }
        Ok(action)
    }

    pub fn process_playback(
        &self,
        notification: PlaybackNotification,
    ) -> Result<Option<Action>, TranslateError> {
        self.process(&Notification::Playback(notification))
    }

    pub fn process_watched(
        &self,
        notification: WatchedNotification,
    ) -> Result<Option<Action>, TranslateError> {
        self.process(&Notification::Watched(notification))
    }
}

/// Result of [`Router::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// An action was handed to the worker's debouncer.
    Queued(Action),
    /// The notification matched a user but implies no tracker change.
    NoAction,
    /// No linked account; the notification was ignored.
    Unmatched,
}

#[derive(Debug, Default)]
pub struct RouterBuilder {
    by_plex_account_id: HashMap<String, Arc<Processor>>,
    by_plex_username: HashMap<String, Arc<Processor>>,
    by_emby_username: HashMap<String, Arc<Processor>>,
}

impl RouterBuilder {
    pub fn plex_account_id(mut self, id: impl Into<String>, processor: Arc<Processor>) -> Self {
        self.by_plex_account_id.insert(id.into(), processor);
        self
    }

    pub fn plex_username(mut self, username: impl Into<String>, processor: Arc<Processor>) -> Self {
        self.by_plex_username.insert(username.into(), processor);
        self
    }

    pub fn emby_username(mut self, username: impl Into<String>, processor: Arc<Processor>) -> Self {
        self.by_emby_username.insert(username.into(), processor);
        self
    }

    pub fn build(self, history: Arc<HistoryStore>) -> Router {
        Router {
            by_plex_account_id: self.by_plex_account_id,
            by_plex_username: self.by_plex_username,
            by_emby_username: self.by_emby_username,
            history,
        }
    }
}

/// Immutable lookup from media-server identities to processors.
#[derive(Debug)]
pub struct Router {
    by_plex_account_id: HashMap<String, Arc<Processor>>,
    by_plex_username: HashMap<String, Arc<Processor>>,
    by_emby_username: HashMap<String, Arc<Processor>>,
    history: Arc<HistoryStore>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Find the processor for a user: stable account id first, display
    /// username as the fallback.
    pub fn resolve(
        &self,
        server: Server,
        account_id: Option<&str>,
        username: &str,
    ) -> Option<&Arc<Processor>> {
        match server {
            Server::Plex => account_id
                .filter(|id| !id.is_empty())
                .and_then(|id| self.by_plex_account_id.get(id))
                .or_else(|| self.by_plex_username.get(username)),
            Server::Emby => self.by_emby_username.get(username),
        }
    }

    /// Every distinct worker reachable through this router.
    pub fn workers(&self) -> Vec<WorkerHandle> {
        let mut seen: Vec<WorkerHandle> = Vec::new();
        let all = self
            .by_plex_account_id
            .values()
            .chain(self.by_plex_username.values())
            .chain(self.by_emby_username.values());
        for processor in all {
            let worker = processor.worker();
            if !seen.iter().any(|w| w.username() == worker.username()) {
                seen.push(worker.clone());
            }
        }
        seen.sort_by(|a, b| a.username().cmp(b.username()));
        seen
    }

    /// Route, translate and debounce one notification, recording it in the
    /// history. An unknown user is a recorded no-op, not an error.
    pub fn dispatch(
        &self,
        notification: &Notification,
        account_id: Option<&str>,
    ) -> Result<Dispatch, TranslateError> {
        self.dispatch_with_details(notification, account_id, Map::new())
    }

    /// [`Router::dispatch`] with extra adapter-level `details` (event name,
    /// server) merged into the recorded history event.
    #[instrument(skip_all, fields(server = notification.metadata().server.as_str(), username = %notification.metadata().username))]
    pub fn dispatch_with_details(
        &self,
        notification: &Notification,
        account_id: Option<&str>,
        details: Map<String, Value>,
    ) -> Result<Dispatch, TranslateError> {
        let meta = notification.metadata();
        let received = |status| {
            let mut event = HistoryEvent::from_notification(notification, status);
            event.details.extend(details.clone());
            event
        };

        let Some(processor) = self.resolve(meta.server, account_id, &meta.username) else {
            debug!(
                account_id = account_id.unwrap_or_default(),
                "no tracker account for media server user, ignoring notification"
            );
            self.history.add(
                received(Status::Received)
                    .with_detail("outcome", "ignored")
                    .with_detail("reason", "no linked account"),
            );
            return Ok(Dispatch::Unmatched);
        };

        match processor.process(notification) {
            Ok(Some(action)) => {
                debug!(action = action.as_str(), media_id = %action.media_id(), worker = processor.worker().username(), "queued action");
                self.history.add(
                    received(Status::Received)
                        .with_detail("outcome", "queued")
                        .with_detail("action", action.as_str()),
                );
                Ok(Dispatch::Queued(action))
            }
            Ok(None) => {
                self.history
                    .add(received(Status::Received).with_detail("outcome", "no_action"));
                Ok(Dispatch::NoAction)
            }
            Err(err) => {
                warn!(error = %err, "failed to translate notification");
                self.history
                    .add(received(Status::Error).with_error(err.to_string()));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationMetadata;
    use chrono::Utc;
    use std::time::Duration;

    fn metadata(media_id: &str) -> NotificationMetadata {
        NotificationMetadata {
            server: Server::Emby,
            username: "alice".into(),
            media_id: media_id.into(),
            title: None,
            time: Utc::now(),
        }
    }

    fn playback(playing: bool, position_secs: u64, runtime_secs: u64) -> Notification {
        Notification::Playback(PlaybackNotification {
            metadata: metadata("tt0133093"),
            playing,
            position: Duration::from_secs(position_secs),
            runtime: Duration::from_secs(runtime_secs),
        })
    }

    fn watched(media_id: &str, watched: bool) -> Notification {
        Notification::Watched(WatchedNotification {
            metadata: metadata(media_id),
            watched,
            runtime: Duration::from_secs(100),
        })
    }

    fn logging() -> TranslationPolicy {
        TranslationPolicy {
            log_films: true,
            ..Default::default()
        }
    }

    #[test]
    fn watched_flag_follows_log_films() {
        let marked = TranslationPolicy::default()
            .translate(&watched("tt0133093", true))
            .unwrap();
        assert!(matches!(marked, Some(Action::MarkWatched(ref t)) if t.media_id == "tt0133093"));

        let logged = logging().translate(&watched("tt0133093", true)).unwrap();
        assert!(matches!(logged, Some(Action::LogWatched(_))));
    }

    #[test]
    fn unwatched_is_always_mark_unwatched() {
        for policy in [TranslationPolicy::default(), logging()] {
            let action = policy.translate(&watched("tt0133093", false)).unwrap();
            assert!(matches!(action, Some(Action::MarkUnwatched(_))));
        }
    }

    #[test]
    fn playing_never_produces_an_action() {
        let policy = TranslationPolicy::default();
        assert_eq!(policy.translate(&playback(true, 100, 100)).unwrap(), None);
        assert_eq!(policy.translate(&playback(true, 10, 100)).unwrap(), None);
    }

    #[test]
    fn paused_playback_uses_threshold_inclusively() {
        let policy = TranslationPolicy::default();
        assert!(matches!(
            policy.translate(&playback(false, 90, 100)).unwrap(),
            Some(Action::MarkWatched(_))
        ));
        assert_eq!(policy.translate(&playback(false, 89, 100)).unwrap(), None);
        assert!(matches!(
            logging().translate(&playback(false, 100, 100)).unwrap(),
            Some(Action::LogWatched(_))
        ));

        let strict = TranslationPolicy {
            completion_threshold: 1.0,
            ..Default::default()
        };
        assert_eq!(strict.translate(&playback(false, 95, 100)).unwrap(), None);
    }

    #[test]
    fn unknown_runtime_is_never_complete() {
        let policy = TranslationPolicy::default();
        assert_eq!(policy.translate(&playback(false, 0, 0)).unwrap(), None);
        assert_eq!(policy.translate(&playback(false, 50, 0)).unwrap(), None);
    }

    #[test]
    fn blank_media_id_is_rejected() {
        let policy = TranslationPolicy::default();
        assert_eq!(
            policy.translate(&watched("", true)),
            Err(TranslateError::MissingMediaId)
        );
        assert_eq!(
            policy.translate(&watched("   ", true)),
            Err(TranslateError::MissingMediaId)
        );
    }
}
