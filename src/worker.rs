//! One worker per tracker account: drains the account's queue strictly in
//! order and applies each action through the retry engine.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::debounce::{Debouncer, MergeFn};
use crate::history::{EventType, HistoryEvent, HistoryStore, Status};
use crate::metrics::Metrics;
use crate::model::Action;
use crate::retry::{with_retry, RetryConfig};
use crate::tracker::ActionClient;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    LoggingIn,
    Processing,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub username: String,
    pub queue_capacity: usize,
    pub quiet_period: Duration,
    pub retry: RetryConfig,
}

impl WorkerConfig {
    pub fn new(username: impl Into<String>, quiet_period: Duration) -> Self {
        Self {
            username: username.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            quiet_period,
            retry: RetryConfig::default(),
        }
    }
}

/// Producer side of a worker. Cheap to clone; shared by every processor
/// routed to the same account.
#[derive(Clone)]
pub struct WorkerHandle {
    username: Arc<str>,
    debouncer: Debouncer,
    queue: mpsc::Sender<Action>,
    state: watch::Receiver<WorkerState>,
    in_flight: Arc<AtomicUsize>,
    client: Arc<dyn ActionClient>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("username", &self.username)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Hand `action` to the debouncer. Returns immediately.
    pub fn submit(&self, action: Action) {
        self.debouncer.debounce(action);
    }

    /// Put `action` straight on the queue, skipping the quiet period. Waits
    /// for room when the queue is full.
    pub async fn enqueue(&self, action: Action) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(action).await.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("worker for {} has stopped", self.username));
        }
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Actions waiting in the queue (not counting ones still debouncing).
    pub fn queued(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    pub fn debouncing(&self) -> usize {
        self.debouncer.pending()
    }

    /// Actions that left the debouncer (or were enqueued directly) and have
    /// not finished processing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Nothing debouncing, queued or being applied.
    pub fn is_drained(&self) -> bool {
        // Pending first: an entry leaving the map is already counted in flight.
        self.debouncing() == 0 && self.in_flight() == 0
    }

    /// Whether the tracker client currently holds a session.
    pub fn connected(&self) -> bool {
        self.client.connected()
    }
}

pub struct Worker {
    username: Arc<str>,
    client: Arc<dyn ActionClient>,
    queue: mpsc::Receiver<Action>,
    retry: RetryConfig,
    history: Arc<HistoryStore>,
    metrics: Arc<Metrics>,
    state: watch::Sender<WorkerState>,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    /// Start the worker task and return its handle. Uses newest-wins
    /// coalescing.
    pub fn spawn(
        config: WorkerConfig,
        client: Arc<dyn ActionClient>,
        history: Arc<HistoryStore>,
        metrics: Arc<Metrics>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        Self::spawn_with_merge(config, client, history, metrics, None)
    }

    pub fn spawn_with_merge(
        config: WorkerConfig,
        client: Arc<dyn ActionClient>,
        history: Arc<HistoryStore>,
        metrics: Arc<Metrics>,
        merge: Option<MergeFn>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let username: Arc<str> = Arc::from(config.username.as_str());

        let debouncer = match merge {
            Some(merge) => Debouncer::with_merge(tx.clone(), config.quiet_period, merge),
            None => Debouncer::new(tx.clone(), config.quiet_period),
        };
        let in_flight = debouncer.in_flight_counter();
        let handle = WorkerHandle {
            username: username.clone(),
            debouncer,
            queue: tx,
            state: state_rx,
            in_flight: in_flight.clone(),
            client: client.clone(),
        };

        let worker = Worker {
            username,
            client,
            queue: rx,
            retry: config.retry,
            history,
            metrics,
            state: state_tx,
            in_flight,
        };
        let join = tokio::spawn(worker.run());
        (handle, join)
    }

    #[instrument(skip_all, fields(username = %self.username))]
    async fn run(mut self) {
        self.state.send_replace(WorkerState::LoggingIn);
        let op = format!("login(username={})", self.username);
        if let Err(err) = with_retry(&op, &self.retry, || self.client.login()).await {
            error!(error = %err, "failed to login during worker initialization");
        }
        self.state.send_replace(WorkerState::Idle);

        while let Some(action) = self.queue.recv().await {
            self.state.send_replace(WorkerState::Processing);
            self.process(&action).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.state.send_replace(WorkerState::Idle);
        }

        warn!("worker queue closed; stopping");
    }

    async fn process(&self, action: &Action) {
        let target = action.target();
        let started = Instant::now();
        let result = self.execute(action).await;
        let elapsed = started.elapsed();
        self.metrics.track_action(result.is_ok(), elapsed);

        let status = if result.is_ok() {
            Status::Success
        } else {
            Status::Error
        };
        let mut event = HistoryEvent::new(EventType::Watched, target.source, status)
            .with_user(&target.username)
            .with_media(&target.media_id, target.title.as_deref())
            .with_detail("action", action.as_str())
            .with_detail("account", &*self.username)
            .with_detail("occurred_at", target.occurred_at.to_rfc3339())
            .with_processing_time(elapsed);

        match result {
            Ok(()) => {
                info!(
                    action = action.describe(),
                    media_id = %target.media_id,
                    event_time = %target.occurred_at,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "successfully processed event"
                );
            }
            Err(err) => {
                let message = format!("{:#}", err);
                error!(
                    action = action.describe(),
                    media_id = %target.media_id,
                    event_time = %target.occurred_at,
                    error = %message,
                    "failed to process event"
                );
                event = event.with_error(message);
            }
        }
        self.history.add(event);
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        let target = action.target();
        let op = format!("{}(media_id={})", action.as_str(), target.media_id);
        match action {
            Action::MarkWatched(_) => {
                with_retry(&op, &self.retry, || self.client.set_watched(&target.media_id, true)).await
            }
            Action::MarkUnwatched(_) => {
                with_retry(&op, &self.retry, || self.client.set_watched(&target.media_id, false)).await
            }
            Action::LogWatched(_) => {
                with_retry(&op, &self.retry, || {
                    self.client.log_watched(&target.media_id, target.occurred_at)
                })
                .await
            }
        }
    }
}
