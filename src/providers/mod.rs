use crate::{ActivityKind, Event};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Provider-backed work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Instance-level messages: starts, completions, cancellations.
    Orchestrator,
    /// Activity executions.
    Worker,
}

/// Messages exchanged through the provider queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        kind: ActivityKind,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        output: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::CancelInstance { instance, .. } => instance,
        }
    }
}

/// Durable per-instance log plus the queues and leases the runtime needs.
///
/// A provider is pure storage: it never interprets entries beyond refusing
/// appends after a terminal entry and enforcing its history cap. Replay
/// validation lives in `runtime::replay`.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an empty log for a new instance. Fails if it already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError>;
    /// Remove an instance and its log.
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;
    /// Read the full log in append order.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;
    /// Append entries atomically with respect to other appends on this store.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError>;
    /// List every known instance id.
    async fn list_instances(&self) -> Vec<String>;
    /// Human-readable dump of all logs (diagnostics).
    async fn dump_all_pretty(&self) -> String;

    /// Enqueue a work item. Enqueuing an item identical to one already queued is a no-op.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;
    /// Take the head item and keep it invisible until `ack` or `abandon`.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;
    /// Return a locked item to the front of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;
    /// Items of `instance` in either queue, queued or peek-locked.
    async fn outstanding_work(&self, instance: &str) -> Result<Vec<WorkItem>, ProviderError>;

    /// Acquire the instance lease for `owner`, renew it if `owner` already
    /// holds it, or take it over once expired. Returns false if another owner
    /// holds a live lease.
    async fn try_acquire_lease(&self, instance: &str, owner: &str, ttl: Duration) -> Result<bool, ProviderError>;
    /// Release the lease if `owner` holds it.
    async fn release_lease(&self, instance: &str, owner: &str) -> Result<(), ProviderError>;
}

/// Shared append guard: cap and closed-log checks.
///
/// A lone terminal entry is exempt from the cap so a full log can always be closed.
pub(crate) fn check_append(
    instance: &str,
    existing: &[Event],
    new_events: &[Event],
    cap: usize,
) -> Result<(), ProviderError> {
    let closing = matches!(new_events, [ev] if ev.is_terminal());
    if !closing && existing.len() + new_events.len() > cap {
        return Err(ProviderError::CapExceeded {
            cap,
            have: existing.len(),
            append: new_events.len(),
        });
    }
    let mut closed = existing.last().is_some_and(Event::is_terminal);
    for ev in new_events {
        if closed {
            return Err(ProviderError::HistoryClosed(instance.to_string()));
        }
        closed = ev.is_terminal();
    }
    Ok(())
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
