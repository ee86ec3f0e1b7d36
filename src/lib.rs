//! Durable fan-out/fan-in orchestration that builds a transaction status report.
//!
//! This crate records every scheduling decision and completion of a report run
//! as an append-only `Event` log and replays that log to decide what happens
//! next, so a run can crash at any point and resume without duplicating work.
//! It provides:
//!
//! - Public data model: `Event`, `TransactionRef`, `StatusResolution`, `ReportEntry`
//! - A pure replay core (`runtime::replay`) that folds a log into state and decisions
//! - The in-process `Runtime` that fetches a batch, fans out one status lookup per
//!   transaction, waits for all of them, and aggregates the results
//! - An `InstanceController` to start runs, cancel them, and query their status
//! - History providers: in-memory and filesystem (JSONL)

pub mod client;
pub mod error;
pub mod logging;
pub mod options;
pub mod providers;
pub mod report;
pub mod runtime;
pub mod source;

pub use client::{InstanceController, InstanceState, InstanceStatus, StartedInstance};
pub use error::{ActivityError, ControllerError, EngineError, ReplayError};
pub use options::{FailurePolicy, ReportConfig, RetryPolicy, RuntimeOptions, SourceConfig};
pub use report::aggregate;
pub use runtime::{ActivityExecutor, ActivityRegistry, Runtime};
pub use source::{BatchFetcher, FileTransactionSource, InMemoryTransactionSource, MinuteBucketResolver, StatusResolver};

use serde::{Deserialize, Serialize};

// Internal codec utilities for activity payloads (kept private; log entries carry plain strings)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, serde_json::Error>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, serde_json::Error>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, serde_json::Error> {
            serde_json::to_string(v)
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, serde_json::Error> {
            serde_json::from_str(s)
        }
    }
}

/// Activity id reserved for the batch fetch. Resolve activities use the
/// 1-based position of their transaction in the returned batch.
pub const FETCH_ACTIVITY_ID: u64 = 0;

/// Label of the report bucket that collects failed lookups.
pub const ERROR_BUCKET: &str = "error";

/// Stable, human-readable identity of one logical activity.
pub fn activity_key(instance: &str, id: u64) -> String {
    format!("{instance}::{id}")
}

/// The two kinds of activity a report run schedules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    FetchBatch,
    ResolveStatus,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::FetchBatch => f.write_str("FetchBatch"),
            ActivityKind::ResolveStatus => f.write_str("ResolveStatus"),
        }
    }
}

/// A payment transaction as returned by the batch source. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRef {
    /// Opaque record identifier.
    pub id: String,
    /// Identifier of the charge at the payment processor.
    pub charge_id: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

/// The four order status categories a resolver can report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Received,
    Processing,
    Shipped,
    Delivered,
}

impl OrderStatus {
    /// Map a 1-based ordinal (1..=4) onto a status.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            1 => Some(OrderStatus::Received),
            2 => Some(OrderStatus::Processing),
            3 => Some(OrderStatus::Shipped),
            4 => Some(OrderStatus::Delivered),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::Received => "received",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
        }
    }
}

/// Output of a successful `ResolveStatus` activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResolution {
    pub status: OrderStatus,
    pub order_id: String,
}

/// Outcome of one resolve activity as reconstructed from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityResult {
    pub activity_id: u64,
    pub outcome: Result<StatusResolution, String>,
}

/// One row of the final report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportEntry {
    pub status: String,
    pub count: u64,
}

/// Append-only log entries for one report instance, persisted by a provider
/// and consumed during replay. Activity ids pair schedules with completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was created. Pins every input the decision logic depends on.
    OrchestrationStarted {
        created_at_ms: u64,
        max_records: usize,
        failure_policy: FailurePolicy,
    },
    /// The batch fetch (activity id 0) was scheduled.
    BatchRequested { max_records: usize },
    /// The batch fetch returned these records, in source order.
    BatchReturned { records: Vec<TransactionRef> },
    /// An activity was scheduled with a stable id and input.
    ActivityScheduled { id: u64, kind: ActivityKind, input: String },
    /// Activity completed successfully with an output payload.
    ActivityCompleted { id: u64, output: String },
    /// Activity failed after exhausting its retry policy.
    ActivityFailed { id: u64, error: String },
    /// Cancellation was requested; the terminal entry follows deterministically.
    OrchestrationCancelRequested { reason: String },
    /// Terminal: the report was produced.
    OrchestrationCompleted { result: Vec<ReportEntry> },
    /// Terminal: the run failed.
    OrchestrationFailed { error: String },
    /// Terminal: the run was cancelled.
    OrchestrationCancelled { reason: String },
}

impl Event {
    /// True for entries after which nothing else may be appended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } | Event::OrchestrationCancelled { .. }
        )
    }

    /// Short name used in logs and corruption reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::OrchestrationStarted { .. } => "OrchestrationStarted",
            Event::BatchRequested { .. } => "BatchRequested",
            Event::BatchReturned { .. } => "BatchReturned",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::OrchestrationCancelRequested { .. } => "OrchestrationCancelRequested",
            Event::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            Event::OrchestrationFailed { .. } => "OrchestrationFailed",
            Event::OrchestrationCancelled { .. } => "OrchestrationCancelled",
        }
    }
}
