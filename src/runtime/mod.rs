use crate::client::InstanceController;
use crate::error::EngineError;
use crate::options::RuntimeOptions;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::{ActivityKind, Event};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod router;
pub mod status;

pub use registry::{ActivityExecutor, ActivityHandler, ActivityRegistry, ActivityRegistryBuilder};
pub use replay::{Decision, DefaultReplayEngine, Dispatch, Phase, ReplayEngine, ReplayState};
pub use router::{InstanceRouter, OrchestratorMsg};

use replay::Terminal;

/// In-process runtime that drives report instances, executes their
/// activities, and persists every step through a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    activity_tasks: Mutex<JoinSet<()>>,
    history_store: Arc<dyn HistoryStore>,
    executor: Arc<dyn ActivityExecutor>,
    active_instances: std::sync::Mutex<HashSet<String>>,
    engine: DefaultReplayEngine,
    options: RuntimeOptions,
    /// Lease owner identity of this runtime.
    owner: String,
}

/// Removes the instance from the active set when its driver ends, including on panic.
struct ActiveGuard {
    rt: Arc<Runtime>,
    inst: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.rt.active_set().remove(&self.inst);
    }
}

impl Runtime {
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const LEASE_RETRY_CAP_MS: u64 = 250;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(executor: Arc<dyn ActivityExecutor>, options: RuntimeOptions) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new_with_cap(options.history_cap));
        Self::start_with_store(history_store, executor, options).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    ///
    /// Every non-terminal instance already present in the store is queued
    /// for resumption.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        executor: Arc<dyn ActivityExecutor>,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::default()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            activity_tasks: Mutex::new(JoinSet::new()),
            history_store,
            executor,
            active_instances: std::sync::Mutex::new(HashSet::new()),
            engine: DefaultReplayEngine::new(),
            options,
            owner: uuid::Uuid::new_v4().to_string(),
        });

        runtime.resume_pending_instances().await;

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.push(work_handle);

        info!(owner = %runtime.owner, "runtime started");
        runtime
    }

    /// Controller bound to this runtime's store and start defaults.
    pub fn controller(&self) -> InstanceController {
        InstanceController::new(self.history_store.clone(), &self.options)
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn owner_id(&self) -> &str {
        &self.owner
    }

    /// Abort dispatchers, instance drivers and in-flight activities.
    ///
    /// Nothing is flushed: unacknowledged work and held leases are left for
    /// the next runtime on the same store, exactly as after a crash.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
        self.activity_tasks.lock().await.abort_all();
        info!(owner = %self.owner, "runtime shut down");
    }

    fn active_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active_instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self, instance: &str) -> bool {
        self.active_set().contains(instance)
    }

    async fn resume_pending_instances(&self) {
        for instance in self.history_store.list_instances().await {
            let history = match self.history_store.read(&instance).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(instance = %instance, error=%e, "skipping unreadable instance on startup");
                    continue;
                }
            };
            match self.engine.replay(&history) {
                Ok(state) if state.phase().is_terminal() => {}
                Ok(state) => {
                    debug!(instance = %instance, phase = ?state.phase(), "resuming instance");
                    if let Err(e) = self
                        .history_store
                        .enqueue_work(QueueKind::Orchestrator, WorkItem::StartOrchestration { instance: instance.clone() })
                        .await
                    {
                        warn!(instance = %instance, error=%e, "failed to enqueue resume");
                    }
                }
                Err(e) => error!(instance = %instance, error=%e, "not resuming instance with corrupt log"),
            }
        }
    }

    /// Spawn a driver for `instance` unless one is already active here.
    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        if self.is_active(instance) {
            return false;
        }
        let rt = self.clone();
        let inst = instance.to_string();
        let handle = tokio::spawn(async move {
            match rt.clone().run_instance_to_completion(&inst).await {
                Ok(phase) => debug!(instance = %inst, ?phase, "instance driver exited"),
                Err(EngineError::AlreadyActive(_)) => debug!(instance = %inst, "instance driver already active"),
                Err(EngineError::LeaseHeld(_)) => {
                    warn!(instance = %inst, "lease still held elsewhere; requeueing start");
                    let _ = rt
                        .history_store
                        .enqueue_work(QueueKind::Orchestrator, WorkItem::StartOrchestration { instance: inst.clone() })
                        .await;
                }
                Err(e) => error!(instance = %inst, error=%e, "instance driver stopped"),
            }
        });
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
        true
    }

    /// Deliver a message to the active driver, or rehydrate the instance and
    /// put the message back for redelivery. Messages for unknown, terminal
    /// or corrupt instances are acked and dropped.
    async fn deliver_or_rehydrate(self: &Arc<Self>, msg: OrchestratorMsg) {
        let msg = match self.router.try_send(msg).await {
            Ok(()) => return,
            Err(msg) => msg,
        };
        let instance = msg.instance().to_string();
        let token = msg.ack_token().to_string();
        let drop_reason = match self.history_store.read(&instance).await {
            Err(e) if e.is_not_found() => Some("unknown instance".to_string()),
            Err(e @ ProviderError::Corrupt { .. }) => Some(e.to_string()),
            Err(e) => {
                warn!(instance = %instance, error=%e, "failed to read log; retrying delivery");
                let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                tokio::time::sleep(Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
                return;
            }
            Ok(history) => match self.engine.replay(&history) {
                Ok(state) if state.phase().is_terminal() => Some("instance is terminal".to_string()),
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            },
        };
        if let Some(reason) = drop_reason {
            debug!(instance = %instance, %reason, "dropping orchestrator message");
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }
        self.ensure_instance_active(&instance).await;
        let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
        tokio::time::sleep(Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(self.options.poller_idle_sleep()).await;
                    continue;
                };
                match item {
                    WorkItem::StartOrchestration { instance } => {
                        debug!(instance = %instance, "StartOrchestration");
                        self.ensure_instance_active(&instance).await;
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    }
                    WorkItem::ActivityCompleted { instance, id, output } => {
                        debug!(instance = %instance, activity_id = id, "ActivityCompleted");
                        self.deliver_or_rehydrate(OrchestratorMsg::ActivityCompleted {
                            instance,
                            id,
                            output,
                            ack_token: token,
                        })
                        .await;
                    }
                    WorkItem::ActivityFailed { instance, id, error } => {
                        debug!(instance = %instance, activity_id = id, %error, "ActivityFailed");
                        self.deliver_or_rehydrate(OrchestratorMsg::ActivityFailed {
                            instance,
                            id,
                            error,
                            ack_token: token,
                        })
                        .await;
                    }
                    WorkItem::CancelInstance { instance, reason } => {
                        debug!(instance = %instance, %reason, "CancelInstance");
                        self.deliver_or_rehydrate(OrchestratorMsg::CancelRequested {
                            instance,
                            reason,
                            ack_token: token,
                        })
                        .await;
                    }
                    other @ WorkItem::ActivityExecute { .. } => {
                        error!(?other, "unexpected WorkItem in Orchestrator dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    }
                }
            }
        })
    }

    /// Executes worker items with at most `max_concurrent_activities` in flight.
    /// A permit is taken before dequeuing so queued work stays visible to
    /// other runtimes while this one is saturated.
    fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_activities.max(1)));
        tokio::spawn(async move {
            loop {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    drop(permit);
                    tokio::time::sleep(self.options.poller_idle_sleep()).await;
                    continue;
                };
                let rt = self.clone();
                let mut tasks = self.activity_tasks.lock().await;
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move {
                    let _permit = permit;
                    rt.execute_work_item(item, token).await;
                });
            }
        })
    }

    async fn execute_work_item(&self, item: WorkItem, token: String) {
        let (instance, id, kind, input) = match item {
            WorkItem::ActivityExecute { instance, id, kind, input } => (instance, id, kind, input),
            other => {
                error!(?other, "unexpected WorkItem in Worker dispatcher; dropping");
                let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                return;
            }
        };
        let policy = match kind {
            ActivityKind::FetchBatch => &self.options.fetch_retry,
            ActivityKind::ResolveStatus => &self.options.activity_retry,
        };
        debug!(activity = %crate::activity_key(&instance, id), %kind, "executing activity");
        let completion = match retry::execute_with_retry(self.executor.as_ref(), &instance, id, kind, &input, policy).await
        {
            Ok(output) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                id,
                output,
            },
            Err(e) => WorkItem::ActivityFailed {
                instance: instance.clone(),
                id,
                error: e.to_string(),
            },
        };
        match self.history_store.enqueue_work(QueueKind::Orchestrator, completion).await {
            Ok(()) => {
                let _ = self.history_store.ack(QueueKind::Worker, &token).await;
            }
            Err(e) => {
                warn!(instance = %instance, activity_id = id, error=%e, "failed to report activity outcome; will re-execute");
                let _ = self.history_store.abandon(QueueKind::Worker, &token).await;
            }
        }
    }

    /// Drive one activation of `instance`: take its lease, replay the log,
    /// re-dispatch outstanding work, then apply decisions and completions until
    /// the instance is terminal or idle.
    pub async fn run_instance_to_completion(self: Arc<Self>, instance: &str) -> Result<Phase, EngineError> {
        if !self.active_set().insert(instance.to_string()) {
            return Err(EngineError::AlreadyActive(instance.to_string()));
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        self.acquire_lease(instance).await?;
        let mut inbox = self.router.register(instance).await;
        let outcome = self.drive(instance, &mut inbox).await;

        self.router.unregister(instance).await;
        inbox.close();
        let terminal = matches!(&outcome, Ok(phase) if phase.is_terminal());
        while let Ok(msg) = inbox.try_recv() {
            if terminal {
                let _ = self.history_store.ack(QueueKind::Orchestrator, msg.ack_token()).await;
            } else {
                let _ = self.history_store.abandon(QueueKind::Orchestrator, msg.ack_token()).await;
            }
        }
        if let Err(e) = self.history_store.release_lease(instance, &self.owner).await {
            warn!(instance, error=%e, "failed to release lease");
        }
        outcome
    }

    /// Wait for the instance lease, giving up after two lease lifetimes.
    async fn acquire_lease(&self, instance: &str) -> Result<(), EngineError> {
        let ttl = self.options.lease_ttl();
        let deadline = Instant::now() + ttl * 2;
        let retry = (ttl / 4)
            .min(Duration::from_millis(Self::LEASE_RETRY_CAP_MS))
            .max(Duration::from_millis(1));
        loop {
            if self.history_store.try_acquire_lease(instance, &self.owner, ttl).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::LeaseHeld(instance.to_string()));
            }
            debug!(instance, "lease held by another owner; waiting");
            tokio::time::sleep(retry).await;
        }
    }

    async fn renew_lease(&self, instance: &str) -> Result<(), EngineError> {
        if self
            .history_store
            .try_acquire_lease(instance, &self.owner, self.options.lease_ttl())
            .await?
        {
            Ok(())
        } else {
            Err(EngineError::LeaseLost(instance.to_string()))
        }
    }

    async fn drive(
        &self,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Result<Phase, EngineError> {
        let history = self.history_store.read(instance).await?;
        let mut state = match self.engine.replay(&history) {
            Ok(s) => s,
            Err(e) => {
                error!(instance, error=%e, "log corruption; instance stopped");
                return Err(e.into());
            }
        };
        if state.phase().is_terminal() {
            return Ok(state.phase());
        }

        // Rehydrate: outcomes never recorded and not still in flight are dispatched again
        let pending = self.engine.pending_dispatches(&state);
        let pending = if pending.is_empty() {
            pending
        } else {
            match self.history_store.outstanding_work(instance).await {
                Ok(outstanding) => dispatch::not_in_flight(pending, &outstanding),
                Err(e) => {
                    warn!(instance, error=%e, "cannot inspect queued work; re-dispatching all pending activities");
                    pending
                }
            }
        };
        let redispatch: Vec<WorkItem> = pending.iter().map(|d| dispatch::dispatch_work(instance, d)).collect();
        if !redispatch.is_empty() {
            info!(instance, count = redispatch.len(), "re-dispatching outstanding activities");
            dispatch::enqueue_all(self.history_store.as_ref(), instance, redispatch).await;
        }

        loop {
            let decisions = self.engine.decide(&state);
            if !decisions.is_empty() {
                self.renew_lease(instance).await?;
                let events: Vec<Event> = decisions.iter().map(dispatch::decision_event).collect();
                for ev in &events {
                    state.record(ev)?;
                }
                if let Some(closed) = self.append_or_close(instance, events).await? {
                    return Ok(closed);
                }
                let work: Vec<WorkItem> = decisions
                    .iter()
                    .filter_map(|d| dispatch::decision_work(instance, d))
                    .collect();
                if !work.is_empty() {
                    debug!(instance, count = work.len(), phase = ?state.phase(), "dispatching activities");
                }
                dispatch::enqueue_all(self.history_store.as_ref(), instance, work).await;
            }

            if let Some(terminal) = &state.terminal {
                match terminal {
                    Terminal::Completed(report) => info!(instance, groups = report.len(), "instance completed"),
                    Terminal::Failed(error) => warn!(instance, %error, "instance failed"),
                    Terminal::Cancelled(reason) => info!(instance, %reason, "instance cancelled"),
                }
                return Ok(state.phase());
            }

            let first = match tokio::time::timeout(self.options.idle_dehydrate(), inbox.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => {
                    debug!(instance, phase = ?state.phase(), "dehydrating idle instance");
                    return Ok(state.phase());
                }
            };
            let mut batch = vec![first];
            while batch.len() < Self::COMPLETION_BATCH_LIMIT {
                match inbox.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            let mut new_events = Vec::new();
            let mut tokens = Vec::with_capacity(batch.len());
            let mut recorded: Result<(), EngineError> = Ok(());
            for msg in &batch {
                tokens.push(msg.ack_token().to_string());
                if recorded.is_err() {
                    continue;
                }
                for ev in completions::completion_events(instance, &state, msg) {
                    if let Err(e) = state.record(&ev) {
                        recorded = Err(e.into());
                        break;
                    }
                    new_events.push(ev);
                }
            }
            let persisted = match recorded {
                Err(e) => Err(e),
                Ok(()) if new_events.is_empty() => Ok(None),
                Ok(()) => match self.renew_lease(instance).await {
                    Ok(()) => self.append_or_close(instance, new_events).await,
                    Err(e) => Err(e),
                },
            };
            let closed = match persisted {
                Ok(closed) => closed,
                Err(e) => {
                    for t in &tokens {
                        let _ = self.history_store.abandon(QueueKind::Orchestrator, t).await;
                    }
                    return Err(e);
                }
            };
            // Completions are acked only once their entries are durable
            for t in &tokens {
                let _ = self.history_store.ack(QueueKind::Orchestrator, t).await;
            }
            if let Some(phase) = closed {
                return Ok(phase);
            }
        }
    }

    /// Append `events`, or close the instance as failed when its log is full.
    ///
    /// Returns the terminal phase when the instance was closed instead.
    async fn append_or_close(&self, instance: &str, events: Vec<Event>) -> Result<Option<Phase>, EngineError> {
        match self.history_store.append(instance, events).await {
            Ok(()) => Ok(None),
            Err(e @ ProviderError::CapExceeded { .. }) => {
                let error = format!("log capacity exhausted: {e}");
                warn!(instance, %error, "instance failed");
                self.history_store
                    .append(instance, vec![Event::OrchestrationFailed { error }])
                    .await?;
                Ok(Some(Phase::Failed))
            }
            Err(e) => Err(e.into()),
        }
    }
}
