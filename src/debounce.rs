//! Coalesces bursts of actions for the same title into one.
//!
//! Every media id gets at most one pending entry. Each new action for that id
//! is merged into the entry and pushes its deadline out by the quiet period.
//! Once a quiet period passes without updates the entry is removed and its
//! action is sent to the worker queue. A full queue makes the timer task wait
//! for room; actions are never dropped.
//!
//! An action leaving the pending map is counted as in flight until the
//! consumer decrements the shared counter from [`Debouncer::in_flight_counter`].
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::Action;

/// Combines the pending action for a title with a newer one.
pub type MergeFn = Arc<dyn Fn(Action, Action) -> Action + Send + Sync>;

/// Default merge rule: the newest action replaces whatever was pending.
pub fn latest_wins(_pending: Action, incoming: Action) -> Action {
    incoming
}

struct DebounceEntry {
    action: Action,
    last_update: Instant,
}

struct Inner {
    pending: Mutex<HashMap<String, DebounceEntry>>,
    quiet_period: Duration,
    queue: mpsc::Sender<Action>,
    merge: MergeFn,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("quiet_period", &self.inner.quiet_period)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Debouncer {
    pub fn new(queue: mpsc::Sender<Action>, quiet_period: Duration) -> Self {
        Self::with_merge(queue, quiet_period, Arc::new(latest_wins))
    }

    pub fn with_merge(queue: mpsc::Sender<Action>, quiet_period: Duration, merge: MergeFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                quiet_period,
                queue,
                merge,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet_period
    }

    /// Number of titles waiting for their quiet period to elapse.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Actions emitted (or being emitted) to the queue and not yet finished
    /// by the consumer.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        self.inner.in_flight.clone()
    }

    /// Queue `action` for emission once its title has been quiet long enough.
    /// Must be called from within a tokio runtime.
    pub fn debounce(&self, action: Action) {
        let key = action.media_id().to_string();
        let now = Instant::now();

        let mut pending = self.inner.pending.lock();
        if let Some(entry) = pending.remove(&key) {
            let merged = (self.inner.merge)(entry.action, action);
            debug!(media_id = %key, action = merged.as_str(), "debounce: superseded pending action");
            pending.insert(
                key,
                DebounceEntry {
                    action: merged,
                    last_update: now,
                },
            );
            return;
        }

        debug!(media_id = %key, action = action.as_str(), "debounce: new pending action");
        pending.insert(
            key.clone(),
            DebounceEntry {
                action,
                last_update: now,
            },
        );
        drop(pending);

        tokio::spawn(run_timer(self.inner.clone(), key));
    }
}

async fn run_timer(inner: Arc<Inner>, key: String) {
    loop {
        let deadline = {
            let pending = inner.pending.lock();
            match pending.get(&key) {
                Some(entry) => entry.last_update + inner.quiet_period,
                None => return,
            }
        };
        tokio::time::sleep_until(deadline).await;

        let ready = {
            let mut pending = inner.pending.lock();
            let expired = match pending.get(&key) {
                Some(entry) => entry.last_update + inner.quiet_period <= Instant::now(),
                None => return,
            };
            if expired {
                // Counted under the lock: observers see the action either
                // pending or in flight.
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                pending.remove(&key).map(|entry| entry.action)
            } else {
                None
            }
        };

        if let Some(action) = ready {
            debug!(media_id = %key, action = action.as_str(), "debounce: quiet period elapsed");
            if inner.queue.send(action).await.is_err() {
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                warn!(media_id = %key, "debounce: worker queue closed, action discarded");
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionTarget, Server};
    use chrono::Utc;
    use tokio::sync::mpsc::error::TryRecvError;

    const QUIET: Duration = Duration::from_secs(1);

    fn target(id: &str) -> ActionTarget {
        ActionTarget {
            media_id: id.into(),
            occurred_at: Utc::now(),
            source: Server::Plex,
            username: "alice".into(),
            title: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_quiet_period_emits_last_action() {
        let (tx, mut rx) = mpsc::channel(10);
        let debouncer = Debouncer::new(tx, QUIET);

        debouncer.debounce(Action::MarkWatched(target("tt1")));
        tokio::time::sleep(Duration::from_millis(300)).await;
        debouncer.debounce(Action::MarkUnwatched(target("tt1")));
        tokio::time::sleep(Duration::from_millis(900)).await;
        debouncer.debounce(Action::LogWatched(target("tt1")));
        assert_eq!(debouncer.pending(), 1);

        let emitted = rx.recv().await.unwrap();
        assert!(matches!(&emitted, Action::LogWatched(t) if t.media_id == "tt1"));

        tokio::time::sleep(QUIET * 5).await;
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn events_separated_by_quiet_period_emit_twice_in_order() {
        let (tx, mut rx) = mpsc::channel(10);
        let debouncer = Debouncer::new(tx, QUIET);

        debouncer.debounce(Action::MarkWatched(target("tt1")));
        tokio::time::sleep(QUIET + Duration::from_millis(500)).await;
        debouncer.debounce(Action::MarkUnwatched(target("tt1")));

        assert!(matches!(rx.recv().await, Some(Action::MarkWatched(_))));
        assert!(matches!(rx.recv().await, Some(Action::MarkUnwatched(_))));
        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_titles_are_independent() {
        let (tx, mut rx) = mpsc::channel(10);
        let debouncer = Debouncer::new(tx, QUIET);

        debouncer.debounce(Action::MarkWatched(target("tt1")));
        debouncer.debounce(Action::MarkWatched(target("tt2")));
        assert_eq!(debouncer.pending(), 2);

        let mut ids = vec![
            rx.recv().await.unwrap().media_id().to_string(),
            rx.recv().await.unwrap().media_id().to_string(),
        ];
        ids.sort();
        assert_eq!(ids, vec!["tt1", "tt2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_applies_backpressure_without_dropping() {
        let (tx, mut rx) = mpsc::channel(1);
        let debouncer = Debouncer::new(tx, QUIET);

        debouncer.debounce(Action::MarkWatched(target("tt1")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        debouncer.debounce(Action::MarkWatched(target("tt2")));
        // Both timers fire; the second one waits for room in the queue.
        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(debouncer.pending(), 0);
        // tt2 left the pending map but is still blocked on the send.
        assert_eq!(debouncer.in_flight(), 2);

        assert_eq!(rx.recv().await.unwrap().media_id(), "tt1");
        assert_eq!(rx.recv().await.unwrap().media_id(), "tt2");

        let counter = debouncer.in_flight_counter();
        counter.fetch_sub(2, Ordering::SeqCst);
        assert_eq!(debouncer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_releases_in_flight_count() {
        let (tx, rx) = mpsc::channel(1);
        let debouncer = Debouncer::new(tx, QUIET);
        drop(rx);

        debouncer.debounce(Action::MarkWatched(target("tt1")));
        tokio::time::sleep(QUIET * 2).await;
        assert_eq!(debouncer.pending(), 0);
        assert_eq!(debouncer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_merge_keeps_watched_over_unwatched() {
        let (tx, mut rx) = mpsc::channel(10);
        let merge: MergeFn = Arc::new(|pending, incoming| match (&pending, &incoming) {
            (Action::MarkWatched(_), Action::MarkUnwatched(_)) => pending,
            _ => incoming,
        });
        let debouncer = Debouncer::with_merge(tx, QUIET, merge);

        debouncer.debounce(Action::MarkWatched(target("tt1")));
        debouncer.debounce(Action::MarkUnwatched(target("tt1")));

        assert!(matches!(rx.recv().await, Some(Action::MarkWatched(_))));
    }
}
