//! In-process counters exposed on `/metrics`.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct PathStats {
    count: u64,
    total_ms: u64,
}

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    started_at: DateTime<Utc>,
    requests: AtomicU64,
    requests_ok: AtomicU64,
    requests_failed: AtomicU64,
    actions_ok: AtomicU64,
    actions_failed: AtomicU64,
    action_ms_total: AtomicU64,
    webhooks: Mutex<HashMap<String, u64>>,
    paths: Mutex<HashMap<String, PathStats>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            requests: AtomicU64::new(0),
            requests_ok: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            actions_ok: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
            action_ms_total: AtomicU64::new(0),
            webhooks: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub request_count: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub webhook_count: HashMap<String, u64>,
    pub requests_by_path: HashMap<String, u64>,
    pub avg_time_by_path_ms: HashMap<String, u64>,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub avg_action_ms: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record one HTTP request. 2xx and 3xx count as successful.
    pub fn track_request(&self, path: &str, status: u16, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if (200..400).contains(&status) {
            self.requests_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut paths = self.paths.lock();
        let stats = paths.entry(path.to_string()).or_default();
        stats.count += 1;
        stats.total_ms += elapsed.as_millis() as u64;
    }

    pub fn track_webhook(&self, source: &str) {
        *self.webhooks.lock().entry(source.to_string()).or_insert(0) += 1;
    }

    pub fn track_action(&self, success: bool, elapsed: Duration) {
        if success {
            self.actions_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.actions_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.action_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let paths = self.paths.lock().clone();
        let actions_ok = self.actions_ok.load(Ordering::Relaxed);
        let actions_failed = self.actions_failed.load(Ordering::Relaxed);
        let actions = actions_ok + actions_failed;
        MetricsSnapshot {
            uptime_seconds: self.uptime().as_secs(),
            request_count: self.requests.load(Ordering::Relaxed),
            successful_requests: self.requests_ok.load(Ordering::Relaxed),
            failed_requests: self.requests_failed.load(Ordering::Relaxed),
            webhook_count: self.webhooks.lock().clone(),
            requests_by_path: paths.iter().map(|(p, s)| (p.clone(), s.count)).collect(),
            avg_time_by_path_ms: paths
                .iter()
                .filter(|(_, s)| s.count > 0)
                .map(|(p, s)| (p.clone(), s.total_ms / s.count))
                .collect(),
            actions_succeeded: actions_ok,
            actions_failed,
            avg_action_ms: if actions == 0 {
                0
            } else {
                self.action_ms_total.load(Ordering::Relaxed) / actions
            },
        }
    }
}
