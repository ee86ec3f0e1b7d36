use std::collections::HashSet;

use tracing::warn;

use super::replay::{Decision, Dispatch};
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{ActivityKind, Event, FETCH_ACTIVITY_ID};

/// The log entry that records a decision.
pub fn decision_event(decision: &Decision) -> Event {
    match decision {
        Decision::RequestBatch { max_records } => Event::BatchRequested {
            max_records: *max_records,
        },
        Decision::Schedule { id, input } => Event::ActivityScheduled {
            id: *id,
            kind: ActivityKind::ResolveStatus,
            input: input.clone(),
        },
        Decision::Complete { result } => Event::OrchestrationCompleted { result: result.clone() },
        Decision::Fail { error } => Event::OrchestrationFailed { error: error.clone() },
        Decision::Cancel { reason } => Event::OrchestrationCancelled { reason: reason.clone() },
    }
}

/// Worker item a decision requires once its entry is persisted, if any.
pub fn decision_work(instance: &str, decision: &Decision) -> Option<WorkItem> {
    match decision {
        Decision::RequestBatch { max_records } => Some(WorkItem::ActivityExecute {
            instance: instance.to_string(),
            id: FETCH_ACTIVITY_ID,
            kind: ActivityKind::FetchBatch,
            input: max_records.to_string(),
        }),
        Decision::Schedule { id, input } => Some(WorkItem::ActivityExecute {
            instance: instance.to_string(),
            id: *id,
            kind: ActivityKind::ResolveStatus,
            input: input.clone(),
        }),
        Decision::Complete { .. } | Decision::Fail { .. } | Decision::Cancel { .. } => None,
    }
}

pub fn dispatch_work(instance: &str, dispatch: &Dispatch) -> WorkItem {
    WorkItem::ActivityExecute {
        instance: instance.to_string(),
        id: dispatch.id,
        kind: dispatch.kind,
        input: dispatch.input.clone(),
    }
}

/// Drop dispatches whose activity still has an item queued or locked: either
/// the execute item itself or its not yet recorded outcome.
pub fn not_in_flight(pending: Vec<Dispatch>, outstanding: &[WorkItem]) -> Vec<Dispatch> {
    let in_flight: HashSet<u64> = outstanding
        .iter()
        .filter_map(|item| match item {
            WorkItem::ActivityExecute { id, .. }
            | WorkItem::ActivityCompleted { id, .. }
            | WorkItem::ActivityFailed { id, .. } => Some(*id),
            WorkItem::StartOrchestration { .. } | WorkItem::CancelInstance { .. } => None,
        })
        .collect();
    pending.into_iter().filter(|d| !in_flight.contains(&d.id)).collect()
}

/// Enqueue worker items. Failures are logged; the items are re-derived from
/// the log on the next activation of the instance.
pub async fn enqueue_all(store: &dyn HistoryStore, instance: &str, items: Vec<WorkItem>) {
    for item in items {
        if let Err(e) = store.enqueue_work(QueueKind::Worker, item).await {
            warn!(instance, error=%e, "failed to enqueue activity; will re-dispatch on rehydration");
        }
    }
}
