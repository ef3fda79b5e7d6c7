//! Error types for the lifecycle core.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DesiredState, HostId};

/// Classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    Timeout,
    NotFound,
    ExecutionFailed,
    Unrecognized,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::NotFound => write!(f, "not found"),
            Self::ExecutionFailed => write!(f, "execution failed"),
            Self::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Failure of a single engine call.
///
/// Never returned to the web layer directly: the reconciler records it on
/// the host and retries with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("engine {kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(op: &str, after: std::time::Duration) -> Self {
        Self::new(
            EngineErrorKind::Timeout,
            format!("{} did not finish within {}ms", op, after.as_millis()),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ExecutionFailed, message)
    }

    pub fn unrecognized(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Unrecognized, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == EngineErrorKind::NotFound
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == EngineErrorKind::Timeout
    }
}

/// Synchronous rejection of a lifecycle intent.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("cannot move {id} from {from} to {to} with a new spec; request absent first")]
    InvalidTransition {
        id: HostId,
        from: DesiredState,
        to: DesiredState,
    },

    #[error("host {0} has no spec; a spec is required to create it")]
    MissingSpec(HostId),

    #[error("invalid spec for {id}: {reason}")]
    InvalidSpec { id: HostId, reason: String },

    #[error("host not found: {0}")]
    NotFound(HostId),

    #[error("failed to persist intent: {0}")]
    Store(#[from] StoreError),
}

/// Failure of the desired-state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
