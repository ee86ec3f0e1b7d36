use durable_report::error::{ActivityError, ControllerError, ProviderError, ReplayError};
use durable_report::options::{FailurePolicy, RetryPolicy, RuntimeOptions};
use durable_report::providers::fs::FsHistoryStore;
use durable_report::providers::in_memory::InMemoryHistoryStore;
use durable_report::providers::{HistoryStore, QueueKind, WorkItem};
use durable_report::runtime::dispatch::not_in_flight;
use durable_report::runtime::registry::{ActivityExecutor, ActivityRegistry};
use durable_report::runtime::replay::{Decision, Dispatch, Phase, decide, pending_dispatches, replay};
use durable_report::runtime::retry::execute_with_retry;
use durable_report::runtime::status::derive_status;
use durable_report::source::{InMemoryTransactionSource, MinuteBucketResolver, StatusResolver};
use durable_report::{
    ActivityKind, ActivityResult, Event, InstanceController, InstanceState, OrderStatus, ReportEntry, SourceConfig,
    StatusResolution, TransactionRef, aggregate,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
mod common;
use common::{resolved, txn};

fn ok(id: u64, status: OrderStatus) -> ActivityResult {
    ActivityResult {
        activity_id: id,
        outcome: Ok(StatusResolution {
            status,
            order_id: format!("o{id}"),
        }),
    }
}

fn failed(id: u64) -> ActivityResult {
    ActivityResult {
        activity_id: id,
        outcome: Err("boom".into()),
    }
}

fn entry(status: &str, count: u64) -> ReportEntry {
    ReportEntry {
        status: status.to_string(),
        count,
    }
}

fn started(max_records: usize) -> Event {
    Event::OrchestrationStarted {
        created_at_ms: 1,
        max_records,
        failure_policy: FailurePolicy::ContinueWithErrorBucket,
    }
}

fn scheduled(id: u64, t: &TransactionRef) -> Event {
    Event::ActivityScheduled {
        id,
        kind: ActivityKind::ResolveStatus,
        input: serde_json::to_string(t).unwrap(),
    }
}

/// A log that has fetched `records` and scheduled all of them.
fn fanned_out(records: &[TransactionRef]) -> Vec<Event> {
    let mut h = vec![
        started(10),
        Event::BatchRequested { max_records: 10 },
        Event::BatchReturned {
            records: records.to_vec(),
        },
    ];
    for (i, t) in records.iter().enumerate() {
        h.push(scheduled(i as u64 + 1, t));
    }
    h
}

fn corruption_reason(history: &[Event]) -> String {
    match replay(history) {
        Err(ReplayError::LogCorruption { reason, .. }) => reason,
        Ok(state) => panic!("expected corruption, replay reached {:?}", state.phase()),
    }
}

// ---------------- aggregation

#[test]
fn aggregate_groups_and_orders_by_label() {
    let results = vec![
        ok(1, OrderStatus::Shipped),
        ok(2, OrderStatus::Received),
        ok(3, OrderStatus::Shipped),
        ok(4, OrderStatus::Delivered),
    ];
    assert_eq!(
        aggregate(&results),
        vec![entry("delivered", 1), entry("received", 1), entry("shipped", 2)]
    );
}

#[test]
fn aggregate_counts_failures_in_error_bucket() {
    let results = vec![ok(1, OrderStatus::Received), failed(2), ok(3, OrderStatus::Shipped)];
    assert_eq!(
        aggregate(&results),
        vec![entry("error", 1), entry("received", 1), entry("shipped", 1)]
    );
}

#[test]
fn aggregate_of_nothing_is_empty() {
    assert!(aggregate(&[]).is_empty());
}

fn status_strategy() -> impl Strategy<Value = Option<OrderStatus>> {
    prop_oneof![
        Just(Some(OrderStatus::Received)),
        Just(Some(OrderStatus::Processing)),
        Just(Some(OrderStatus::Shipped)),
        Just(Some(OrderStatus::Delivered)),
        Just(None),
    ]
}

proptest! {
    #[test]
    fn aggregate_is_order_independent(
        (statuses, perm) in prop::collection::vec(status_strategy(), 0..40)
            .prop_flat_map(|v| {
                let n = v.len();
                (Just(v), Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
            })
    ) {
        let results: Vec<ActivityResult> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| match s {
                Some(s) => ok(i as u64 + 1, *s),
                None => failed(i as u64 + 1),
            })
            .collect();
        let permuted: Vec<ActivityResult> = perm.iter().map(|i| results[*i].clone()).collect();
        let report = aggregate(&results);
        prop_assert_eq!(&report, &aggregate(&permuted));
        prop_assert_eq!(report.iter().map(|e| e.count).sum::<u64>(), results.len() as u64);
    }
}

// ---------------- replay and decisions

#[test]
fn fresh_instance_requests_the_batch() {
    let state = replay(&[started(100)]).unwrap();
    assert_eq!(state.phase(), Phase::Pending);
    assert_eq!(decide(&state), vec![Decision::RequestBatch { max_records: 100 }]);
    assert!(pending_dispatches(&state).is_empty());
}

#[test]
fn waiting_on_fetch_decides_nothing_but_redispatches_fetch() {
    let state = replay(&[started(5), Event::BatchRequested { max_records: 5 }]).unwrap();
    assert_eq!(state.phase(), Phase::Fetching);
    assert!(decide(&state).is_empty());
    let pending = pending_dispatches(&state);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, 0);
    assert_eq!(pending[0].kind, ActivityKind::FetchBatch);
    assert_eq!(pending[0].input, "5");
}

#[test]
fn returned_batch_schedules_every_record_in_order() {
    let records = vec![txn("a", 0), txn("b", 1), txn("c", 2)];
    let history = vec![
        started(10),
        Event::BatchRequested { max_records: 10 },
        Event::BatchReturned {
            records: records.clone(),
        },
    ];
    let state = replay(&history).unwrap();
    assert_eq!(state.phase(), Phase::FanningOut);
    let decisions = decide(&state);
    assert_eq!(decisions.len(), 3);
    for (i, d) in decisions.iter().enumerate() {
        match d {
            Decision::Schedule { id, input } => {
                assert_eq!(*id, i as u64 + 1);
                let t: TransactionRef = serde_json::from_str(input).unwrap();
                assert_eq!(t, records[i]);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }
}

#[test]
fn partially_scheduled_batch_only_schedules_the_rest() {
    let records = vec![txn("a", 0), txn("b", 1), txn("c", 2)];
    let mut history = fanned_out(&records);
    history.truncate(4); // start, requested, returned, schedule #1
    let state = replay(&history).unwrap();
    let ids: Vec<u64> = decide(&state)
        .iter()
        .map(|d| match d {
            Decision::Schedule { id, .. } => *id,
            other => panic!("unexpected decision {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn barrier_holds_until_every_activity_has_an_outcome() {
    let records = vec![txn("a", 0), txn("b", 1)];
    let mut history = fanned_out(&records);
    history.push(Event::ActivityCompleted {
        id: 2,
        output: resolved("b", OrderStatus::Processing),
    });
    let state = replay(&history).unwrap();
    assert_eq!(state.phase(), Phase::AwaitingCompletion);
    assert!(decide(&state).is_empty());
    let pending = pending_dispatches(&state);
    assert_eq!(pending.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1]);

    history.push(Event::ActivityFailed {
        id: 1,
        error: "permanent: gone".into(),
    });
    let state = replay(&history).unwrap();
    assert_eq!(state.phase(), Phase::Aggregating);
    assert_eq!(
        decide(&state),
        vec![Decision::Complete {
            result: vec![entry("error", 1), entry("processing", 1)]
        }]
    );
}

#[test]
fn empty_batch_completes_with_empty_report() {
    let history = vec![
        started(10),
        Event::BatchRequested { max_records: 10 },
        Event::BatchReturned { records: vec![] },
    ];
    let state = replay(&history).unwrap();
    assert_eq!(state.phase(), Phase::Aggregating);
    assert_eq!(decide(&state), vec![Decision::Complete { result: vec![] }]);
}

#[test]
fn strict_policy_fails_on_first_recorded_failure() {
    let records = vec![txn("a", 0), txn("b", 1)];
    let mut history = fanned_out(&records);
    history[0] = Event::OrchestrationStarted {
        created_at_ms: 1,
        max_records: 10,
        failure_policy: FailurePolicy::FailOnAnyActivityFailure,
    };
    history.push(Event::ActivityFailed {
        id: 2,
        error: "permanent: gone".into(),
    });
    let state = replay(&history).unwrap();
    match decide(&state).as_slice() {
        [Decision::Fail { error }] => assert!(error.contains("activity 2"), "{error}"),
        other => panic!("unexpected decisions {other:?}"),
    }
}

#[test]
fn cancel_request_wins_over_pending_work() {
    let records = vec![txn("a", 0)];
    let mut history = fanned_out(&records);
    history.push(Event::OrchestrationCancelRequested { reason: "user".into() });
    let state = replay(&history).unwrap();
    assert_eq!(decide(&state), vec![Decision::Cancel { reason: "user".into() }]);
    assert!(pending_dispatches(&state).is_empty());
}

#[test]
fn terminal_log_decides_nothing() {
    let mut history = vec![
        started(10),
        Event::BatchRequested { max_records: 10 },
        Event::BatchReturned { records: vec![] },
    ];
    history.push(Event::OrchestrationCompleted { result: vec![] });
    let state = replay(&history).unwrap();
    assert_eq!(state.phase(), Phase::Completed);
    assert!(decide(&state).is_empty());
    assert!(pending_dispatches(&state).is_empty());
}

// ---------------- corruption

#[test]
fn log_must_start_with_start_record() {
    assert!(corruption_reason(&[]).contains("OrchestrationStarted"));
    assert!(corruption_reason(&[Event::BatchRequested { max_records: 1 }]).contains("OrchestrationStarted"));
    assert!(corruption_reason(&[started(1), started(1)]).contains("duplicate"));
}

#[test]
fn batch_out_of_order_or_oversized_is_corruption() {
    assert!(
        corruption_reason(&[started(2), Event::BatchReturned { records: vec![] }]).contains("without BatchRequested")
    );
    let oversized = vec![
        started(1),
        Event::BatchRequested { max_records: 1 },
        Event::BatchReturned {
            records: vec![txn("a", 0), txn("b", 1)],
        },
    ];
    assert!(corruption_reason(&oversized).contains("exceeds"));
}

#[test]
fn scheduling_violations_are_corruption() {
    let a = txn("a", 0);
    assert!(corruption_reason(&[started(2), scheduled(1, &a)]).contains("before the batch"));

    let mut dup = fanned_out(std::slice::from_ref(&a));
    dup.push(scheduled(1, &a));
    assert!(corruption_reason(&dup).contains("twice"));

    let mut out_of_range = fanned_out(std::slice::from_ref(&a));
    out_of_range.push(scheduled(2, &a));
    assert!(corruption_reason(&out_of_range).contains("outside batch"));

    let mut mismatch = fanned_out(std::slice::from_ref(&a));
    mismatch.truncate(3);
    mismatch.push(scheduled(1, &txn("z", 9)));
    assert!(corruption_reason(&mismatch).contains("does not match"));
}

#[test]
fn completion_violations_are_corruption() {
    let a = txn("a", 0);
    let mut unscheduled = fanned_out(std::slice::from_ref(&a));
    unscheduled.truncate(3);
    unscheduled.push(Event::ActivityCompleted {
        id: 1,
        output: resolved("a", OrderStatus::Received),
    });
    assert!(corruption_reason(&unscheduled).contains("unscheduled"));

    let mut twice = fanned_out(std::slice::from_ref(&a));
    twice.push(Event::ActivityCompleted {
        id: 1,
        output: resolved("a", OrderStatus::Received),
    });
    twice.push(Event::ActivityFailed {
        id: 1,
        error: "late".into(),
    });
    assert!(corruption_reason(&twice).contains("second completion"));

    let mut garbage = fanned_out(std::slice::from_ref(&a));
    garbage.push(Event::ActivityCompleted {
        id: 1,
        output: "not json".into(),
    });
    assert!(corruption_reason(&garbage).contains("undecodable"));
}

#[test]
fn terminal_entry_must_close_the_log() {
    let a = txn("a", 0);
    let mut early = fanned_out(std::slice::from_ref(&a));
    early.push(Event::OrchestrationCompleted { result: vec![] });
    assert!(corruption_reason(&early).contains("before all activities finished"));

    let mut trailing = vec![started(1), Event::OrchestrationFailed { error: "x".into() }];
    trailing.push(Event::BatchRequested { max_records: 1 });
    assert!(corruption_reason(&trailing).contains("after terminal"));

    let mut wrong_report = fanned_out(std::slice::from_ref(&a));
    wrong_report.push(Event::ActivityCompleted {
        id: 1,
        output: resolved("a", OrderStatus::Received),
    });
    wrong_report.push(Event::OrchestrationCompleted {
        result: vec![entry("shipped", 1)],
    });
    assert!(corruption_reason(&wrong_report).contains("differs"));
}

// ---------------- providers

async fn exercise_store_contract(store: Arc<dyn HistoryStore>) {
    assert!(matches!(store.read("nope").await, Err(ProviderError::InstanceNotFound(_))));
    store.create_instance("i1").await.unwrap();
    assert!(matches!(
        store.create_instance("i1").await,
        Err(ProviderError::InstanceExists(_))
    ));
    assert!(store.read("i1").await.unwrap().is_empty());

    store
        .append("i1", vec![started(1), Event::BatchRequested { max_records: 1 }])
        .await
        .unwrap();
    store
        .append("i1", vec![Event::OrchestrationFailed { error: "x".into() }])
        .await
        .unwrap();
    assert_eq!(store.read("i1").await.unwrap().len(), 3);
    assert!(matches!(
        store.append("i1", vec![Event::BatchReturned { records: vec![] }]).await,
        Err(ProviderError::HistoryClosed(_))
    ));
    assert!(matches!(
        store.append("ghost", vec![started(1)]).await,
        Err(ProviderError::InstanceNotFound(_))
    ));
    assert_eq!(store.list_instances().await, vec!["i1".to_string()]);
    assert!(store.dump_all_pretty().await.contains("instance=i1"));

    // queues: dedupe, peek-lock, abandon to front, ack
    let a = WorkItem::StartOrchestration { instance: "a".into() };
    let b = WorkItem::StartOrchestration { instance: "b".into() };
    store.enqueue_work(QueueKind::Orchestrator, a.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, a.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, b.clone()).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
    let (item, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(item, a);
    store.abandon(QueueKind::Orchestrator, &token).await.unwrap();
    let (item, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(item, a);
    store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    let (item, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(item, b);
    store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    // outstanding work covers queued and locked items of one instance only
    let exec = WorkItem::ActivityExecute {
        instance: "x".into(),
        id: 1,
        kind: ActivityKind::ResolveStatus,
        input: "{}".into(),
    };
    let done = WorkItem::ActivityCompleted {
        instance: "x".into(),
        id: 2,
        output: "{}".into(),
    };
    let other = WorkItem::StartOrchestration { instance: "y".into() };
    store.enqueue_work(QueueKind::Worker, exec.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, done.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, other.clone()).await.unwrap();
    let (locked, exec_token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(locked, exec);
    let mut outstanding = store.outstanding_work("x").await.unwrap();
    outstanding.sort_by_key(|item| format!("{item:?}"));
    assert_eq!(outstanding, vec![done.clone(), exec.clone()]);
    assert_eq!(store.outstanding_work("y").await.unwrap(), vec![other]);
    store.ack(QueueKind::Worker, &exec_token).await.unwrap();
    while let Some((_, token)) = store.dequeue_peek_lock(QueueKind::Orchestrator).await {
        store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    }
    assert!(store.outstanding_work("x").await.unwrap().is_empty());

    // leases: exclusive while live, renewable by owner, taken over after expiry
    let ttl = Duration::from_millis(50);
    assert!(store.try_acquire_lease("i1", "w1", ttl).await.unwrap());
    assert!(!store.try_acquire_lease("i1", "w2", ttl).await.unwrap());
    assert!(store.try_acquire_lease("i1", "w1", ttl).await.unwrap());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.try_acquire_lease("i1", "w2", ttl).await.unwrap());
    store.release_lease("i1", "w1").await.unwrap();
    assert!(!store.try_acquire_lease("i1", "w1", ttl).await.unwrap());
    store.release_lease("i1", "w2").await.unwrap();
    assert!(store.try_acquire_lease("i1", "w1", ttl).await.unwrap());

    store.remove_instance("i1").await.unwrap();
    assert!(store.list_instances().await.is_empty());
}

#[tokio::test]
async fn in_memory_store_contract() {
    exercise_store_contract(Arc::new(InMemoryHistoryStore::default())).await;
}

#[tokio::test]
async fn fs_store_contract() {
    let td = tempfile::tempdir().unwrap();
    exercise_store_contract(Arc::new(FsHistoryStore::new(td.path(), true))).await;
}

#[tokio::test]
async fn history_cap_is_enforced() {
    let store = InMemoryHistoryStore::new_with_cap(2);
    store.create_instance("i").await.unwrap();
    store.append("i", vec![started(1)]).await.unwrap();
    assert!(matches!(
        store
            .append(
                "i",
                vec![
                    Event::BatchRequested { max_records: 1 },
                    Event::BatchReturned { records: vec![] }
                ]
            )
            .await,
        Err(ProviderError::CapExceeded { cap: 2, .. })
    ));
    store
        .append("i", vec![Event::BatchRequested { max_records: 1 }])
        .await
        .unwrap();
    assert!(matches!(
        store.append("i", vec![Event::BatchReturned { records: vec![] }]).await,
        Err(ProviderError::CapExceeded { cap: 2, have: 2, .. })
    ));
    // A full log can still be closed
    store
        .append("i", vec![Event::OrchestrationFailed { error: "full".into() }])
        .await
        .unwrap();
    assert_eq!(store.read("i").await.unwrap().len(), 3);
}

#[tokio::test]
async fn fs_store_sets_malformed_queue_entries_aside() {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path(), true);
    let item = WorkItem::StartOrchestration { instance: "i".into() };
    store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
    let queue = td.path().join("queues/orch.jsonl");
    let content = std::fs::read_to_string(&queue).unwrap();
    std::fs::write(&queue, format!("{{\"Bogus\":1}}\n{content}")).unwrap();

    let (next, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(next, item);
    store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    let rejected = std::fs::read_to_string(td.path().join("queues/orch.rejected.jsonl")).unwrap();
    assert_eq!(rejected.trim(), "{\"Bogus\":1}");
}

#[tokio::test]
async fn fs_store_requeues_locked_items_on_reopen() {
    let td = tempfile::tempdir().unwrap();
    let first = WorkItem::ActivityExecute {
        instance: "i".into(),
        id: 1,
        kind: ActivityKind::ResolveStatus,
        input: "{}".into(),
    };
    let second = WorkItem::ActivityExecute {
        instance: "i".into(),
        id: 2,
        kind: ActivityKind::ResolveStatus,
        input: "{}".into(),
    };
    {
        let store = FsHistoryStore::new(td.path(), true);
        store.enqueue_work(QueueKind::Worker, first.clone()).await.unwrap();
        store.enqueue_work(QueueKind::Worker, second.clone()).await.unwrap();
        // Picked up and never acked: the process died mid-activity
        let (locked, _) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
        assert_eq!(locked, first);
    }
    let store = FsHistoryStore::new(td.path(), false);
    assert_eq!(std::fs::read_dir(td.path().join("locks/work")).unwrap().count(), 0);
    let (item, token) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(item, first);
    store.ack(QueueKind::Worker, &token).await.unwrap();
    let (item, _) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert_eq!(item, second);
}

#[tokio::test]
async fn fs_store_reports_malformed_lines_as_corrupt() {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path(), true);
    store.create_instance("i").await.unwrap();
    store.append("i", vec![started(1)]).await.unwrap();
    let path = td.path().join("instances").join("i.jsonl");
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("{\"NotAnEvent\":{}}\n");
    std::fs::write(&path, content).unwrap();
    match store.read("i").await {
        Err(ProviderError::Corrupt { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected Corrupt, got {other:?}"),
    }
}

#[tokio::test]
async fn fs_store_survives_reopen() {
    let td = tempfile::tempdir().unwrap();
    {
        let store = FsHistoryStore::new(td.path(), true);
        store.create_instance("i").await.unwrap();
        store.append("i", vec![started(3)]).await.unwrap();
        store
            .enqueue_work(QueueKind::Orchestrator, WorkItem::StartOrchestration { instance: "i".into() })
            .await
            .unwrap();
    }
    let store = FsHistoryStore::new(td.path(), false);
    assert_eq!(store.read("i").await.unwrap(), vec![started(3)]);
    let (item, _) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(item, WorkItem::StartOrchestration { instance: "i".into() });
}

// ---------------- status

#[tokio::test]
async fn controller_reports_unknown_and_pending_instances() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let controller = InstanceController::new(store.clone(), &RuntimeOptions::default());
    assert!(matches!(
        controller.status("missing").await,
        Err(ControllerError::UnknownInstance(id)) if id == "missing"
    ));

    let started = controller.start().await.unwrap();
    assert_eq!(started.status_query, format!("instances/{}/status", started.instance_id));
    let status = controller.status(&started.instance_id).await.unwrap();
    assert_eq!(status.state, InstanceState::Pending);
    assert!(status.created_at_ms > 0);
    assert!(status.result.is_none());

    let hist = store.read(&started.instance_id).await.unwrap();
    assert_eq!(
        hist,
        vec![Event::OrchestrationStarted {
            created_at_ms: status.created_at_ms,
            max_records: 100,
            failure_policy: FailurePolicy::ContinueWithErrorBucket,
        }]
    );
    let (item, _) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(
        item,
        WorkItem::StartOrchestration {
            instance: started.instance_id.clone()
        }
    );
}

#[tokio::test]
async fn controller_rejects_batch_sizes_it_cannot_record() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let options = RuntimeOptions {
        history_cap: 25,
        ..RuntimeOptions::default()
    };
    let controller = InstanceController::new(store.clone(), &options);
    assert!(matches!(
        controller.start_with(0, FailurePolicy::ContinueWithErrorBucket).await,
        Err(ControllerError::InvalidRequest(_))
    ));
    // 11 records need up to 27 entries
    assert!(matches!(
        controller.start_with(11, FailurePolicy::ContinueWithErrorBucket).await,
        Err(ControllerError::InvalidRequest(msg)) if msg.contains("history cap is 25")
    ));
    assert!(store.list_instances().await.is_empty());
    assert!(controller.start_with(10, FailurePolicy::ContinueWithErrorBucket).await.is_ok());
}

#[test]
fn in_flight_activities_are_not_dispatched_again() {
    let pending: Vec<Dispatch> = (1..=4u64)
        .map(|id| Dispatch {
            id,
            kind: ActivityKind::ResolveStatus,
            input: "{}".into(),
        })
        .collect();
    let outstanding = vec![
        WorkItem::ActivityExecute {
            instance: "i".into(),
            id: 1,
            kind: ActivityKind::ResolveStatus,
            input: "{}".into(),
        },
        WorkItem::ActivityCompleted {
            instance: "i".into(),
            id: 2,
            output: "{}".into(),
        },
        WorkItem::ActivityFailed {
            instance: "i".into(),
            id: 3,
            error: "x".into(),
        },
        WorkItem::CancelInstance {
            instance: "i".into(),
            reason: "r".into(),
        },
    ];
    let left = not_in_flight(pending, &outstanding);
    assert_eq!(left.iter().map(|d| d.id).collect::<Vec<_>>(), vec![4]);
}

#[test]
fn corrupt_log_reports_failed_with_cause() {
    let status = derive_status("i", Ok(vec![Event::BatchRequested { max_records: 1 }])).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert!(status.error.unwrap().contains("log corruption"));
    assert!(status.result.is_none());
}

#[test]
fn completed_log_exposes_report() {
    let history = vec![
        started(1),
        Event::BatchRequested { max_records: 1 },
        Event::BatchReturned { records: vec![] },
        Event::OrchestrationCompleted { result: vec![] },
    ];
    let status = derive_status("i", Ok(history)).unwrap();
    assert_eq!(status.state, InstanceState::Completed);
    assert_eq!(status.result, Some(vec![]));
    assert_eq!(status.created_at_ms, 1);
}

// ---------------- activities

#[tokio::test]
async fn unregistered_activity_fails_permanently() {
    let registry = ActivityRegistry::builder().build();
    let err = registry
        .execute(ActivityKind::ResolveStatus, "{}".into())
        .await
        .unwrap_err();
    assert_eq!(err, ActivityError::permanent("unregistered:ResolveStatus"));
}

#[tokio::test]
async fn fetch_activity_truncates_over_delivery() {
    struct Greedy;
    #[async_trait::async_trait]
    impl durable_report::source::BatchFetcher for Greedy {
        async fn fetch(&self, _max: usize) -> Result<Vec<TransactionRef>, ActivityError> {
            Ok((0..10).map(|i| txn(&format!("t{i}"), i)).collect())
        }
    }
    let registry = ActivityRegistry::for_sources(Arc::new(Greedy), Arc::new(MinuteBucketResolver));
    let out = registry.execute(ActivityKind::FetchBatch, "3".into()).await.unwrap();
    let records: Vec<TransactionRef> = serde_json::from_str(&out).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].id, "t0");

    let bad = registry.execute(ActivityKind::FetchBatch, "lots".into()).await.unwrap_err();
    assert!(!bad.is_transient());
}

#[tokio::test]
async fn resolve_activity_round_trips_through_json() {
    let source = InMemoryTransactionSource::new(SourceConfig::default(), vec![]);
    let registry = ActivityRegistry::for_sources(Arc::new(source), Arc::new(MinuteBucketResolver));
    let t = txn("x", 5);
    let out = registry
        .execute(ActivityKind::ResolveStatus, serde_json::to_string(&t).unwrap())
        .await
        .unwrap();
    let r: StatusResolution = serde_json::from_str(&out).unwrap();
    assert_eq!(r.order_id, "x");
    assert_eq!(r.status, OrderStatus::Processing); // 5 % 4 + 1 = 2
    let bad = registry
        .execute(ActivityKind::ResolveStatus, "[]".into())
        .await
        .unwrap_err();
    assert!(!bad.is_transient());
}

#[tokio::test]
async fn minute_bucket_resolver_cycles_through_statuses() {
    let resolver = MinuteBucketResolver;
    let statuses: Vec<OrderStatus> = futures::future::join_all((0..5).map(|m| {
        let t = txn(&format!("m{m}"), m);
        async move { resolver.resolve(&t).await.unwrap().status }
    }))
    .await;
    assert_eq!(
        statuses,
        vec![
            OrderStatus::Received,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Received
        ]
    );
}

#[tokio::test]
async fn retry_stops_on_success_and_on_permanent_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let registry = ActivityRegistry::builder()
        .register(ActivityKind::ResolveStatus, move |_input: String| {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(ActivityError::transient("busy")),
                    _ => Ok("done".to_string()),
                }
            }
        })
        .register(ActivityKind::FetchBatch, |_input: String| async move {
            Err::<String, _>(ActivityError::permanent("no such collection"))
        })
        .build();
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    };
    let out = execute_with_retry(&registry, "i", 1, ActivityKind::ResolveStatus, "", &policy)
        .await
        .unwrap();
    assert_eq!(out, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = execute_with_retry(&registry, "i", 0, ActivityKind::FetchBatch, "1", &policy)
        .await
        .unwrap_err();
    assert_eq!(err, ActivityError::permanent("no such collection"));
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let registry = ActivityRegistry::builder()
        .register(ActivityKind::ResolveStatus, move |_input: String| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(ActivityError::transient("busy"))
            }
        })
        .build();
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
    };
    let err = execute_with_retry(&registry, "i", 1, ActivityKind::ResolveStatus, "", &policy)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
