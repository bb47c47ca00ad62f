//! Classified failures reported by an [`ActionClient`](crate::tracker::ActionClient).
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Broad class of a tracker failure. Drives the default retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    Network,
    Ui,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Network => "network",
            ErrorKind::Ui => "ui",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Retry eligibility an error of this kind carries unless told otherwise.
    pub fn retryable_by_default(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Ui | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{kind} error: {cause}")]
pub struct ActionError {
    pub kind: ErrorKind,
    #[source]
    pub cause: anyhow::Error,
    pub context: Map<String, Value>,
    pub retryable: bool,
}

impl ActionError {
    pub fn new(kind: ErrorKind, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            cause: cause.into(),
            context: Map::new(),
            retryable: kind.retryable_by_default(),
        }
    }

    pub fn auth(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Auth, cause)
    }

    pub fn network(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Network, cause)
    }

    pub fn ui(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Ui, cause)
    }

    pub fn timeout(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Timeout, cause)
    }

    pub fn unknown(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Unknown, cause)
    }

    /// Attach a key/value pair describing where the failure happened.
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Kind of `err` if it is (or wraps) an [`ActionError`].
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<ActionError>().map(|e| e.kind)
}

pub fn is_auth_error(err: &anyhow::Error) -> bool {
    kind_of(err) == Some(ErrorKind::Auth)
}

pub fn is_network_error(err: &anyhow::Error) -> bool {
    kind_of(err) == Some(ErrorKind::Network)
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ActionError>()
        .map(|e| e.retryable)
        .unwrap_or(false)
}
