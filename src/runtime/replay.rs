//! Pure replay core: fold a log into state, validate it, and decide what to do next.
//!
//! Nothing here reads the clock, the environment, or any store. Every input
//! that influences a decision is an entry in the log, so replaying the same log
//! always reaches the same state and the same decisions.
use std::collections::BTreeMap;

use crate::_typed_codec::{Codec, Json};
use crate::error::ReplayError;
use crate::options::FailurePolicy;
use crate::report::aggregate;
use crate::{ActivityKind, ActivityResult, Event, FETCH_ACTIVITY_ID, ReportEntry, StatusResolution, TransactionRef};

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Only the start record exists.
    Pending,
    Fetching,
    FanningOut,
    AwaitingCompletion,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledActivity {
    pub kind: ActivityKind,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed(Vec<ReportEntry>),
    Failed(String),
    Cancelled(String),
}

/// In-memory state of one instance reconstructed from its log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
    pub created_at_ms: u64,
    pub max_records: usize,
    pub failure_policy: FailurePolicy,
    pub batch_requested: bool,
    pub batch: Option<Vec<TransactionRef>>,
    pub scheduled: BTreeMap<u64, ScheduledActivity>,
    pub outcomes: BTreeMap<u64, ActivityResult>,
    pub cancel_requested: Option<String>,
    pub terminal: Option<Terminal>,
    /// Number of log entries folded into this state.
    pub len: usize,
}

impl ReplayState {
    pub fn phase(&self) -> Phase {
        match &self.terminal {
            Some(Terminal::Completed(_)) => return Phase::Completed,
            Some(Terminal::Failed(_)) => return Phase::Failed,
            Some(Terminal::Cancelled(_)) => return Phase::Cancelled,
            None => {}
        }
        match &self.batch {
            None if !self.batch_requested => Phase::Pending,
            None => Phase::Fetching,
            Some(batch) if self.scheduled.len() < batch.len() => Phase::FanningOut,
            Some(_) if self.outcomes.len() < self.scheduled.len() => Phase::AwaitingCompletion,
            Some(_) => Phase::Aggregating,
        }
    }

    /// True once the batch is known, every record is scheduled, and every
    /// scheduled activity has a recorded outcome.
    pub fn barrier_closed(&self) -> bool {
        match &self.batch {
            Some(batch) => self.scheduled.len() == batch.len() && self.outcomes.len() == self.scheduled.len(),
            None => false,
        }
    }

    /// Recorded activity outcomes in activity id order.
    pub fn results(&self) -> Vec<ActivityResult> {
        self.outcomes.values().cloned().collect()
    }

    pub fn has_outcome(&self, id: u64) -> bool {
        self.outcomes.contains_key(&id)
    }

    pub fn is_scheduled(&self, id: u64) -> bool {
        self.scheduled.contains_key(&id)
    }

    /// True while the batch fetch is scheduled but has not returned.
    pub fn awaiting_batch(&self) -> bool {
        self.batch_requested && self.batch.is_none()
    }

    /// Fold one more entry into the state with the same validation replay applies.
    pub fn record(&mut self, ev: &Event) -> Result<(), ReplayError> {
        if self.terminal.is_some() {
            return Err(ReplayError::corruption(self.len, format!("{} after terminal entry", ev.kind_name())));
        }
        apply(self, self.len, ev)?;
        self.len += 1;
        Ok(())
    }
}

/// Pure decisions produced from a replayed state. The runtime materializes
/// them into log entries and work items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Record `BatchRequested` and dispatch the fetch.
    RequestBatch { max_records: usize },
    /// Record `ActivityScheduled` for a batch record and dispatch it.
    Schedule { id: u64, input: String },
    /// The barrier is closed: record the report.
    Complete { result: Vec<ReportEntry> },
    Fail { error: String },
    Cancel { reason: String },
}

/// Work a freshly activated driver must (re)dispatch because its outcome was
/// never recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub id: u64,
    pub kind: ActivityKind,
    pub input: String,
}

pub trait ReplayEngine: Send + Sync {
    /// Validate and fold a full log into state.
    fn replay(&self, history: &[Event]) -> Result<ReplayState, ReplayError>;
    /// Decide the next steps for a replayed state.
    fn decide(&self, state: &ReplayState) -> Vec<Decision>;
    /// Activities recorded as scheduled whose outcome is still missing.
    fn pending_dispatches(&self, state: &ReplayState) -> Vec<Dispatch>;
}

pub struct DefaultReplayEngine;

impl Default for DefaultReplayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(&self, history: &[Event]) -> Result<ReplayState, ReplayError> {
        replay(history)
    }

    fn decide(&self, state: &ReplayState) -> Vec<Decision> {
        decide(state)
    }

    fn pending_dispatches(&self, state: &ReplayState) -> Vec<Dispatch> {
        pending_dispatches(state)
    }
}

pub fn replay(history: &[Event]) -> Result<ReplayState, ReplayError> {
    let Some(Event::OrchestrationStarted {
        created_at_ms,
        max_records,
        failure_policy,
    }) = history.first()
    else {
        return Err(ReplayError::corruption(0, "log must begin with OrchestrationStarted"));
    };

    let mut state = ReplayState {
        created_at_ms: *created_at_ms,
        max_records: *max_records,
        failure_policy: *failure_policy,
        batch_requested: false,
        batch: None,
        scheduled: BTreeMap::new(),
        outcomes: BTreeMap::new(),
        cancel_requested: None,
        terminal: None,
        len: 1,
    };

    for (idx, ev) in history.iter().enumerate().skip(1) {
        if state.terminal.is_some() {
            return Err(ReplayError::corruption(idx, format!("{} after terminal entry", ev.kind_name())));
        }
        apply(&mut state, idx, ev)?;
        state.len = idx + 1;
    }
    Ok(state)
}

fn apply(state: &mut ReplayState, idx: usize, ev: &Event) -> Result<(), ReplayError> {
    match ev {
        Event::OrchestrationStarted { .. } => {
            return Err(ReplayError::corruption(idx, "duplicate OrchestrationStarted"));
        }
        Event::BatchRequested { max_records } => {
            if state.batch_requested {
                return Err(ReplayError::corruption(idx, "duplicate BatchRequested"));
            }
            if *max_records != state.max_records {
                return Err(ReplayError::corruption(
                    idx,
                    format!("BatchRequested max_records={max_records} differs from start record ({})", state.max_records),
                ));
            }
            state.batch_requested = true;
        }
        Event::BatchReturned { records } => {
            if !state.batch_requested {
                return Err(ReplayError::corruption(idx, "BatchReturned without BatchRequested"));
            }
            if state.batch.is_some() {
                return Err(ReplayError::corruption(idx, "duplicate BatchReturned"));
            }
            if records.len() > state.max_records {
                return Err(ReplayError::corruption(
                    idx,
                    format!("batch of {} exceeds max_records={}", records.len(), state.max_records),
                ));
            }
            state.batch = Some(records.clone());
        }
        Event::ActivityScheduled { id, kind, input } => {
            let Some(batch) = &state.batch else {
                return Err(ReplayError::corruption(idx, format!("activity {id} scheduled before the batch returned")));
            };
            if *kind != ActivityKind::ResolveStatus {
                return Err(ReplayError::corruption(idx, format!("unexpected activity kind {kind} for id {id}")));
            }
            if *id == FETCH_ACTIVITY_ID || *id as usize > batch.len() {
                return Err(ReplayError::corruption(idx, format!("activity id {id} outside batch of {}", batch.len())));
            }
            if state.scheduled.contains_key(id) {
                return Err(ReplayError::corruption(idx, format!("activity {id} scheduled twice")));
            }
            let txn: TransactionRef = Json::decode(input)
                .map_err(|e| ReplayError::corruption(idx, format!("activity {id} input undecodable: {e}")))?;
            if txn != batch[(*id - 1) as usize] {
                return Err(ReplayError::corruption(idx, format!("activity {id} input does not match its batch record")));
            }
            state.scheduled.insert(
                *id,
                ScheduledActivity {
                    kind: *kind,
                    input: input.clone(),
                },
            );
        }
        Event::ActivityCompleted { id, output } => {
            check_completion(state, idx, *id)?;
            let resolution: StatusResolution = Json::decode(output)
                .map_err(|e| ReplayError::corruption(idx, format!("activity {id} output undecodable: {e}")))?;
            state.outcomes.insert(
                *id,
                ActivityResult {
                    activity_id: *id,
                    outcome: Ok(resolution),
                },
            );
        }
        Event::ActivityFailed { id, error } => {
            check_completion(state, idx, *id)?;
            state.outcomes.insert(
                *id,
                ActivityResult {
                    activity_id: *id,
                    outcome: Err(error.clone()),
                },
            );
        }
        Event::OrchestrationCancelRequested { reason } => {
            if state.cancel_requested.is_some() {
                return Err(ReplayError::corruption(idx, "duplicate OrchestrationCancelRequested"));
            }
            state.cancel_requested = Some(reason.clone());
        }
        Event::OrchestrationCompleted { result } => {
            if !state.barrier_closed() {
                return Err(ReplayError::corruption(idx, "OrchestrationCompleted before all activities finished"));
            }
            if state.cancel_requested.is_some() {
                return Err(ReplayError::corruption(idx, "OrchestrationCompleted after cancellation was requested"));
            }
            if *result != aggregate(&state.results()) {
                return Err(ReplayError::corruption(idx, "recorded report differs from recorded activity results"));
            }
            state.terminal = Some(Terminal::Completed(result.clone()));
        }
        Event::OrchestrationFailed { error } => {
            state.terminal = Some(Terminal::Failed(error.clone()));
        }
        Event::OrchestrationCancelled { reason } => {
            if state.cancel_requested.is_none() {
                return Err(ReplayError::corruption(idx, "OrchestrationCancelled without a cancel request"));
            }
            state.terminal = Some(Terminal::Cancelled(reason.clone()));
        }
    }
    Ok(())
}

fn check_completion(state: &ReplayState, idx: usize, id: u64) -> Result<(), ReplayError> {
    if !state.scheduled.contains_key(&id) {
        return Err(ReplayError::corruption(idx, format!("completion for unscheduled activity {id}")));
    }
    if state.outcomes.contains_key(&id) {
        return Err(ReplayError::corruption(idx, format!("second completion for activity {id}")));
    }
    Ok(())
}

pub fn decide(state: &ReplayState) -> Vec<Decision> {
    if state.terminal.is_some() {
        return Vec::new();
    }
    if let Some(reason) = &state.cancel_requested {
        return vec![Decision::Cancel { reason: reason.clone() }];
    }
    let Some(batch) = &state.batch else {
        if state.batch_requested {
            // Suspended on the fetch
            return Vec::new();
        }
        return vec![Decision::RequestBatch {
            max_records: state.max_records,
        }];
    };

    if state.failure_policy == FailurePolicy::FailOnAnyActivityFailure
        && let Some((id, error)) = state.outcomes.iter().find_map(|(id, r)| r.outcome.as_ref().err().map(|e| (*id, e)))
    {
        return vec![Decision::Fail {
            error: format!("activity {id} failed: {error}"),
        }];
    }

    let mut decisions = Vec::new();
    for (pos, record) in batch.iter().enumerate() {
        let id = pos as u64 + 1;
        if state.scheduled.contains_key(&id) {
            continue;
        }
        match Json::encode(record) {
            Ok(input) => decisions.push(Decision::Schedule { id, input }),
            Err(e) => {
                return vec![Decision::Fail {
                    error: format!("failed to encode transaction {}: {e}", record.id),
                }];
            }
        }
    }
    if !decisions.is_empty() {
        return decisions;
    }
    if state.barrier_closed() {
        return vec![Decision::Complete {
            result: aggregate(&state.results()),
        }];
    }
    // Suspended on the fan-in barrier
    Vec::new()
}

pub fn pending_dispatches(state: &ReplayState) -> Vec<Dispatch> {
    if state.terminal.is_some() || state.cancel_requested.is_some() {
        return Vec::new();
    }
    let mut out = Vec::new();
    if state.batch_requested && state.batch.is_none() {
        out.push(Dispatch {
            id: FETCH_ACTIVITY_ID,
            kind: ActivityKind::FetchBatch,
            input: state.max_records.to_string(),
        });
    }
    for (id, s) in &state.scheduled {
        if !state.outcomes.contains_key(id) {
            out.push(Dispatch {
                id: *id,
                kind: s.kind,
                input: s.input.clone(),
            });
        }
    }
    out
}
