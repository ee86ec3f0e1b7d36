//! Error types for activities, replay, the engine and the controller.
use thiserror::Error;

pub use crate::providers::ProviderError;

/// Failure reported by an activity (batch fetch or status lookup).
///
/// Transient failures are retried by the worker under the activity's
/// `RetryPolicy`; permanent failures are recorded immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivityError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ActivityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ActivityError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ActivityError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

/// A log that cannot be replayed. Never repaired; the instance stops.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("log corruption at entry {index}: {reason}")]
    LogCorruption { index: usize, reason: String },
}

impl ReplayError {
    pub(crate) fn corruption(index: usize, reason: impl Into<String>) -> Self {
        ReplayError::LogCorruption {
            index,
            reason: reason.into(),
        }
    }
}

/// Why a driver activation for an instance ended without reaching a phase.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("instance {0} is leased by another worker")]
    LeaseHeld(String),
    #[error("lease on instance {0} was lost")]
    LeaseLost(String),
    #[error("instance {0} is already active in this runtime")]
    AlreadyActive(String),
}

/// Errors surfaced by `InstanceController`.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("timed out waiting for instance {0}")]
    Timeout(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
