//! In-process control surface: start report runs, cancel them, query status.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::ControllerError;
use crate::options::{FailurePolicy, RuntimeOptions};
use crate::providers::{HistoryStore, QueueKind, WorkItem, now_ms};
use crate::Event;
use crate::runtime::status::derive_status;

pub use crate::runtime::status::{InstanceState, InstanceStatus};

/// Returned by `InstanceController::start`: the new id and where to ask for its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedInstance {
    pub instance_id: String,
    pub status_query: String,
}

/// Creates instances and reads their status. Touches nothing beyond the
/// instance log and the orchestrator queue.
#[derive(Clone)]
pub struct InstanceController {
    store: Arc<dyn HistoryStore>,
    max_records: usize,
    failure_policy: FailurePolicy,
    history_cap: usize,
}

impl InstanceController {
    pub fn new(store: Arc<dyn HistoryStore>, options: &RuntimeOptions) -> Self {
        Self {
            store,
            max_records: options.max_records,
            failure_policy: options.failure_policy,
            history_cap: options.history_cap,
        }
    }

    /// Start a run with the configured batch size and failure policy.
    pub async fn start(&self) -> Result<StartedInstance, ControllerError> {
        self.start_with(self.max_records, self.failure_policy).await
    }

    /// Start a run with explicit inputs. Both are pinned in the start record.
    ///
    /// Rejects an empty batch size, and one whose worst-case log would not
    /// fit under the history cap.
    pub async fn start_with(
        &self,
        max_records: usize,
        failure_policy: FailurePolicy,
    ) -> Result<StartedInstance, ControllerError> {
        if max_records == 0 {
            return Err(ControllerError::InvalidRequest("max_records must be at least 1".to_string()));
        }
        let needed = worst_case_log_len(max_records);
        if needed > self.history_cap {
            return Err(ControllerError::InvalidRequest(format!(
                "max_records {max_records} needs up to {needed} log entries but the history cap is {}",
                self.history_cap
            )));
        }
        let instance = uuid::Uuid::new_v4().to_string();
        self.store.create_instance(&instance).await?;
        let started = Event::OrchestrationStarted {
            created_at_ms: now_ms(),
            max_records,
            failure_policy,
        };
        if let Err(e) = self.store.append(&instance, vec![started]).await {
            if let Err(rm) = self.store.remove_instance(&instance).await {
                warn!(instance = %instance, error=%rm, "failed to remove instance after failed start");
            }
            return Err(e.into());
        }
        // A lost start item is recovered when a runtime next starts against this store
        if let Err(e) = self
            .store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.clone(),
                },
            )
            .await
        {
            warn!(instance = %instance, error=%e, "failed to enqueue start; instance will be picked up on runtime start");
        }
        info!(instance = %instance, max_records, ?failure_policy, "report instance started");
        Ok(StartedInstance {
            status_query: format!("instances/{instance}/status"),
            instance_id: instance,
        })
    }

    pub async fn status(&self, instance: &str) -> Result<InstanceStatus, ControllerError> {
        derive_status(instance, self.store.read(instance).await)
    }

    /// Request cancellation. A no-op for instances that already finished.
    pub async fn cancel(&self, instance: &str, reason: impl Into<String>) -> Result<(), ControllerError> {
        let status = self.status(instance).await?;
        if status.state.is_terminal() {
            return Ok(());
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.store.list_instances().await
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, ControllerError> {
        let deadline = Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let status = self.status(instance).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(ControllerError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = delay_ms.saturating_mul(2).min(100);
        }
    }
}

/// Start, batch request and result, one schedule and one outcome per
/// record, a cancel request and the terminal entry.
fn worst_case_log_len(max_records: usize) -> usize {
    max_records.saturating_mul(2).saturating_add(5)
}
