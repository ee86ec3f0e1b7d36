#![allow(dead_code)]

use async_trait::async_trait;
use durable_report::error::ActivityError;
use durable_report::providers::HistoryStore;
use durable_report::source::{BatchFetcher, StatusResolver};
use durable_report::{Event, OrderStatus, RetryPolicy, RuntimeOptions, StatusResolution, TransactionRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Transaction created at the start of the given minute of the hour.
pub fn txn(id: &str, minute: u64) -> TransactionRef {
    TransactionRef {
        id: id.to_string(),
        charge_id: format!("ch_{id}"),
        created_at_ms: 1_700_000_000_000 - (1_700_000_000_000 % 3_600_000) + minute * 60_000,
    }
}

pub fn resolved(id: &str, status: OrderStatus) -> String {
    serde_json::to_string(&StatusResolution {
        status,
        order_id: id.to_string(),
    })
    .unwrap()
}

/// Options tuned for tests: fast retries, short idle and lease windows.
pub fn fast_options() -> RuntimeOptions {
    let quick = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
    };
    RuntimeOptions {
        fetch_retry: quick.clone(),
        activity_retry: quick,
        idle_dehydrate_ms: 200,
        lease_ttl_ms: 300,
        poller_idle_sleep_ms: 5,
        ..RuntimeOptions::default()
    }
}

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await
            && predicate(&hist)
        {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_scheduled(hist: &[Event], id: u64) -> usize {
    hist.iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { id: sid, .. } if *sid == id))
        .count()
}

pub fn count_batch_requests(hist: &[Event]) -> usize {
    hist.iter().filter(|e| matches!(e, Event::BatchRequested { .. })).count()
}

/// Batch source over fixed records that counts calls and can fail the first
/// `transient_failures` calls.
pub struct CountingFetcher {
    records: Vec<TransactionRef>,
    transient_failures: usize,
    permanent: Option<String>,
    pub calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn new(records: Vec<TransactionRef>) -> Self {
        Self {
            records,
            transient_failures: 0,
            permanent: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.transient_failures = n;
        self
    }

    pub fn always_transient(self) -> Self {
        self.failing_first(usize::MAX)
    }

    pub fn permanently(mut self, msg: &str) -> Self {
        self.permanent = Some(msg.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchFetcher for CountingFetcher {
    async fn fetch(&self, max_records: usize) -> Result<Vec<TransactionRef>, ActivityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.permanent {
            return Err(ActivityError::permanent(msg.clone()));
        }
        if n < self.transient_failures {
            return Err(ActivityError::transient("store unavailable"));
        }
        Ok(self.records.iter().take(max_records).cloned().collect())
    }
}

#[derive(Clone)]
pub enum Script {
    Status(OrderStatus),
    /// Fail transiently this many times, then succeed.
    Flaky(usize, OrderStatus),
    Permanent(String),
    /// Never succeeds; always transient.
    Unavailable,
}

/// Resolver driven by a per-transaction script. Records attempts, in-flight
/// concurrency, and optionally sleeps to keep activities outstanding.
pub struct ScriptedResolver {
    scripts: HashMap<String, Script>,
    delay: Duration,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
        Self {
            scripts: scripts.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            delay: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self, id: &str) -> usize {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusResolver for ScriptedResolver {
    async fn resolve(&self, transaction: &TransactionRef) -> Result<StatusResolution, ActivityError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let a = attempts.entry(transaction.id.clone()).or_insert(0);
            *a += 1;
            *a
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let ok = |status: OrderStatus| -> Result<StatusResolution, ActivityError> {
            Ok(StatusResolution {
                status,
                order_id: transaction.id.clone(),
            })
        };
        match self.scripts.get(&transaction.id) {
            None => Err(ActivityError::permanent(format!("no order for {}", transaction.id))),
            Some(Script::Status(s)) => ok(*s),
            Some(Script::Flaky(n, s)) if attempt > *n => ok(*s),
            Some(Script::Flaky(..)) | Some(Script::Unavailable) => Err(ActivityError::transient("resolver timeout")),
            Some(Script::Permanent(msg)) => Err(ActivityError::permanent(msg.clone())),
        }
    }
}
