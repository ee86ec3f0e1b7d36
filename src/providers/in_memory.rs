use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{HistoryStore, ProviderError, QueueKind, WorkItem, check_append};
use crate::Event;

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Process-local history store. Nothing survives the process, but the
/// queue, lock and lease semantics match the filesystem store.
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    queues: Mutex<HashMap<QueueKind, VecDeque<WorkItem>>>,
    locked: Mutex<HashMap<String, (QueueKind, WorkItem)>>,
    leases: Mutex<HashMap<String, Lease>>,
    next_token: AtomicU64,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new_with_cap(4_096)
    }
}

impl InMemoryHistoryStore {
    /// Create a store with a custom history cap (useful for tests).
    pub fn new_with_cap(cap: usize) -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            locked: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            cap,
        }
    }

    /// Number of items currently queued (not counting locked ones).
    pub async fn queue_len(&self, kind: QueueKind) -> usize {
        self.queues.lock().await.get(&kind).map_or(0, VecDeque::len)
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut h = self.histories.lock().await;
        if h.contains_key(instance) {
            return Err(ProviderError::InstanceExists(instance.to_string()));
        }
        h.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        match self.histories.lock().await.remove(instance) {
            Some(_) => Ok(()),
            None => Err(ProviderError::InstanceNotFound(instance.to_string())),
        }
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.histories
            .lock()
            .await
            .get(instance)
            .cloned()
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let mut h = self.histories.lock().await;
        let existing = h
            .get_mut(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        check_append(instance, existing, &new_events, self.cap)?;
        existing.extend(new_events);
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out: Vec<String> = self.histories.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    async fn dump_all_pretty(&self) -> String {
        let h = self.histories.lock().await;
        let mut names: Vec<&String> = h.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(&format!("instance={name}\n"));
            for ev in &h[name] {
                out.push_str(&format!("  {ev:?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut q = self.queues.lock().await;
        let queue = q.entry(kind).or_default();
        if !queue.contains(&item) {
            queue.push_back(item);
        }
        Ok(())
    }

    // Queue and lock maps are always locked in this order, and items move
    // between them under both guards.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut queues = self.queues.lock().await;
        let mut locked = self.locked.lock().await;
        let item = queues.get_mut(&kind)?.pop_front()?;
        let token = format!("mem-{:x}", self.next_token.fetch_add(1, Ordering::Relaxed));
        locked.insert(token.clone(), (kind, item.clone()));
        Some((item, token))
    }

    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.locked.lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut queues = self.queues.lock().await;
        let mut locked = self.locked.lock().await;
        let Some((locked_kind, item)) = locked.remove(token) else {
            return Ok(());
        };
        debug_assert_eq!(locked_kind, kind);
        queues.entry(locked_kind).or_default().push_front(item);
        Ok(())
    }

    async fn outstanding_work(&self, instance: &str) -> Result<Vec<WorkItem>, ProviderError> {
        let queues = self.queues.lock().await;
        let locked = self.locked.lock().await;
        let out = queues
            .values()
            .flatten()
            .chain(locked.values().map(|(_, item)| item))
            .filter(|item| item.instance() == instance)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn try_acquire_lease(&self, instance: &str, owner: &str, ttl: Duration) -> Result<bool, ProviderError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        if let Some(l) = leases.get(instance)
            && l.owner != owner
            && l.expires_at > now
        {
            return Ok(false);
        }
        leases.insert(
            instance.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, instance: &str, owner: &str) -> Result<(), ProviderError> {
        let mut leases = self.leases.lock().await;
        if leases.get(instance).is_some_and(|l| l.owner == owner) {
            leases.remove(instance);
        }
        Ok(())
    }
}
