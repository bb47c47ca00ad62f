//! Exponential backoff around tracker operations.
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{ActionError, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Kinds forced retryable regardless of the error's own flag.
    pub retryable_kinds: Vec<ErrorKind>,
    /// Kinds forced non-retryable. Applied after `retryable_kinds`.
    pub non_retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retryable_kinds: vec![ErrorKind::Network, ErrorKind::Timeout],
            non_retryable_kinds: vec![ErrorKind::Auth],
        }
    }
}

impl RetryConfig {
    /// Whether `err` should be attempted again under this policy.
    pub fn should_retry(&self, err: &anyhow::Error) -> bool {
        let Some(action_err) = err.downcast_ref::<ActionError>() else {
            return false;
        };
        let mut retryable = action_err.retryable;
        if self.retryable_kinds.contains(&action_err.kind) {
            retryable = true;
        }
        if self.non_retryable_kinds.contains(&action_err.kind) {
            retryable = false;
        }
        retryable
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let scaled = delay.as_secs_f64() * self.backoff_factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. Only the terminal error is returned.
pub async fn with_retry<T, F, Fut>(op_name: &str, config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !config.should_retry(&err) || attempt >= max_attempts {
            error!(
                op = op_name,
                attempts = attempt,
                error = %err,
                "operation {} failed after {} attempts",
                op_name,
                attempt
            );
            return Err(err);
        }

        warn!(
            op = op_name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation {} failed, retrying ({}/{})",
            op_name,
            attempt,
            max_attempts
        );
        tokio::time::sleep(delay).await;
        delay = config.next_delay(delay);
        attempt += 1;
    }
}
