use serde::{Deserialize, Serialize};

use super::replay::{Phase, Terminal, replay};
use crate::error::{ControllerError, ProviderError};
use crate::{Event, ReportEntry};

/// Caller-visible lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Failed | InstanceState::Cancelled)
    }
}

impl From<Phase> for InstanceState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Pending => InstanceState::Pending,
            Phase::Fetching | Phase::FanningOut | Phase::AwaitingCompletion | Phase::Aggregating => {
                InstanceState::Running
            }
            Phase::Completed => InstanceState::Completed,
            Phase::Failed => InstanceState::Failed,
            Phase::Cancelled => InstanceState::Cancelled,
        }
    }
}

/// Status of one instance as derived from its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub state: InstanceState,
    pub created_at_ms: u64,
    /// The report, present once `Completed`.
    pub result: Option<Vec<ReportEntry>>,
    /// Failure or cancellation cause.
    pub error: Option<String>,
}

/// Derive the status of `instance` from the outcome of reading its log.
///
/// A log that cannot be read back or replayed is reported as `Failed` with
/// the corruption as its cause; it never yields a partial report.
pub fn derive_status(
    instance: &str,
    history: Result<Vec<Event>, ProviderError>,
) -> Result<InstanceStatus, ControllerError> {
    let history = match history {
        Ok(h) => h,
        Err(ProviderError::InstanceNotFound(_)) => return Err(ControllerError::UnknownInstance(instance.to_string())),
        Err(e @ ProviderError::Corrupt { .. }) => return Ok(corrupt(instance, 0, e.to_string())),
        Err(e) => return Err(e.into()),
    };
    let created_at_ms = match history.first() {
        Some(Event::OrchestrationStarted { created_at_ms, .. }) => *created_at_ms,
        _ => 0,
    };
    let state = match replay(&history) {
        Ok(s) => s,
        Err(e) => return Ok(corrupt(instance, created_at_ms, e.to_string())),
    };
    let (result, error) = match &state.terminal {
        Some(Terminal::Completed(report)) => (Some(report.clone()), None),
        Some(Terminal::Failed(error)) => (None, Some(error.clone())),
        Some(Terminal::Cancelled(reason)) => (None, Some(format!("cancelled: {reason}"))),
        None => (None, None),
    };
    Ok(InstanceStatus {
        instance_id: instance.to_string(),
        state: state.phase().into(),
        created_at_ms,
        result,
        error,
    })
}

fn corrupt(instance: &str, created_at_ms: u64, cause: String) -> InstanceStatus {
    InstanceStatus {
        instance_id: instance.to_string(),
        state: InstanceState::Failed,
        created_at_ms,
        result: None,
        error: Some(cause),
    }
}
