use tracing::{debug, warn};

use super::replay::ReplayState;
use super::router::OrchestratorMsg;
use crate::_typed_codec::{Codec, Json};
use crate::{Event, FETCH_ACTIVITY_ID, StatusResolution, TransactionRef};

/// Translate one inbox message into the log entries it contributes.
///
/// Messages for activities that are not outstanding (duplicates from
/// at-least-once delivery, or ids that were never scheduled) contribute
/// nothing and are only acked.
pub fn completion_events(instance: &str, state: &ReplayState, msg: &OrchestratorMsg) -> Vec<Event> {
    if state.terminal.is_some() {
        debug!(instance, "dropping message for terminal instance");
        return Vec::new();
    }
    match msg {
        OrchestratorMsg::ActivityCompleted { id, output, .. } if *id == FETCH_ACTIVITY_ID => {
            if !state.awaiting_batch() {
                debug!(instance, "ignoring duplicate batch completion");
                return Vec::new();
            }
            match Json::decode::<Vec<TransactionRef>>(output) {
                Ok(records) if records.len() <= state.max_records => vec![Event::BatchReturned { records }],
                Ok(records) => vec![Event::OrchestrationFailed {
                    error: format!(
                        "batch fetch returned {} records, more than max_records={}",
                        records.len(),
                        state.max_records
                    ),
                }],
                Err(e) => vec![Event::OrchestrationFailed {
                    error: format!("batch fetch returned an undecodable batch: {e}"),
                }],
            }
        }
        OrchestratorMsg::ActivityFailed { id, error, .. } if *id == FETCH_ACTIVITY_ID => {
            if !state.awaiting_batch() {
                debug!(instance, "ignoring duplicate batch failure");
                return Vec::new();
            }
            vec![Event::OrchestrationFailed {
                error: format!("batch fetch failed: {error}"),
            }]
        }
        OrchestratorMsg::ActivityCompleted { id, output, .. } => {
            if !outstanding(instance, state, *id) {
                return Vec::new();
            }
            match Json::decode::<StatusResolution>(output) {
                Ok(_) => vec![Event::ActivityCompleted {
                    id: *id,
                    output: output.clone(),
                }],
                Err(e) => {
                    warn!(instance, id, error=%e, "activity returned an undecodable resolution");
                    vec![Event::ActivityFailed {
                        id: *id,
                        error: format!("undecodable status resolution: {e}"),
                    }]
                }
            }
        }
        OrchestratorMsg::ActivityFailed { id, error, .. } => {
            if !outstanding(instance, state, *id) {
                return Vec::new();
            }
            vec![Event::ActivityFailed {
                id: *id,
                error: error.clone(),
            }]
        }
        OrchestratorMsg::CancelRequested { reason, .. } => {
            if state.cancel_requested.is_some() {
                return Vec::new();
            }
            vec![Event::OrchestrationCancelRequested { reason: reason.clone() }]
        }
    }
}

fn outstanding(instance: &str, state: &ReplayState, id: u64) -> bool {
    if !state.is_scheduled(id) {
        warn!(instance, id, "ignoring completion for unscheduled activity");
        return false;
    }
    if state.has_outcome(id) {
        debug!(instance, id, "ignoring duplicate completion");
        return false;
    }
    true
}
