//! Builds workers, processors and the router from configuration.
use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, TrackerAccount};
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::router::{Processor, Router};
use crate::tracker::ActionClient;
use crate::worker::{Worker, WorkerConfig, WorkerHandle};

/// Running pipeline: one worker per tracker account behind a shared router.
pub struct Relay {
    router: Arc<Router>,
    history: Arc<HistoryStore>,
    metrics: Arc<Metrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Spawn a worker per distinct tracker username. `make_client` is called
    /// once per worker, so each account gets its own session.
    pub fn start<F>(cfg: &Config, mut make_client: F) -> Result<Self>
    where
        F: FnMut(&TrackerAccount) -> Result<Arc<dyn ActionClient>>,
    {
        let history = Arc::new(HistoryStore::new(cfg.app.history_size));
        let metrics = Arc::new(Metrics::new());
        let retry = cfg.retry.to_retry_config();

        let mut workers: HashMap<String, WorkerHandle> = HashMap::new();
        let mut tasks = Vec::new();
        let mut builder = Router::builder();

        for user in &cfg.users {
            let account = &user.tracker;
            let worker = match workers.get(&account.username) {
                Some(handle) => handle.clone(),
                None => {
                    let client = make_client(account)?;
                    let worker_cfg = WorkerConfig {
                        username: account.username.clone(),
                        queue_capacity: cfg.pipeline.queue_capacity,
                        quiet_period: cfg.pipeline.quiet_period(),
                        retry: retry.clone(),
                    };
                    let (handle, task) =
                        Worker::spawn(worker_cfg, client, history.clone(), metrics.clone());
                    info!(username = %account.username, "started tracker worker");
                    workers.insert(account.username.clone(), handle.clone());
                    tasks.push(task);
                    handle
                }
            };

            let processor = Arc::new(Processor::new(worker, cfg.policy_for(account)));
            if let Some(emby) = &user.emby {
                builder = builder.emby_username(emby.username.clone(), processor.clone());
            }
            if let Some(plex) = &user.plex {
                if !plex.username.is_empty() {
                    builder = builder.plex_username(plex.username.clone(), processor.clone());
                }
                if !plex.id.is_empty() {
                    builder = builder.plex_account_id(plex.id.clone(), processor.clone());
                }
            }
        }

        Ok(Self {
            router: Arc::new(builder.build(history.clone())),
            history,
            metrics,
            tasks,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Wait up to `grace` for queued and debouncing actions to finish, then
    /// abandon whatever is left.
    pub async fn shutdown(self, grace: Duration) {
        let workers = self.router.workers();
        let drained = tokio::time::timeout(grace, async {
            while !workers.iter().all(WorkerHandle::is_drained) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("all workers drained"),
            Err(_) => {
                let remaining: usize = workers.iter().map(|w| w.debouncing() + w.in_flight()).sum();
                warn!(remaining, "shutdown grace period elapsed; abandoning queued actions");
            }
        }
        for task in &self.tasks {
            task.abort();
        }
        // Aborted tasks resolve with a cancellation error.
        join_all(self.tasks).await;
    }
}
