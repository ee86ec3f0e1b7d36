use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{error, warn};

use super::{HistoryStore, ProviderError, QueueKind, WorkItem, check_append, now_ms};
use crate::Event;

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    expires_at_ms: u64,
}

/// Filesystem-backed history store writing one JSONL log per instance.
///
/// Layout under `root`:
/// - `instances/{instance}.jsonl`: the log
/// - `queues/{orch,work}.jsonl`: queued work items
/// - `locks/{orch,work}/{token}.lock`: peek-locked items
/// - `queues/{orch,work}.rejected.jsonl`: queue lines that failed to parse
/// - `leases/{instance}.json`: instance leases
///
/// All operations on one store value are serialized through an internal lock.
pub struct FsHistoryStore {
    root: PathBuf,
    io_lock: Mutex<()>,
    next_token: AtomicU64,
    cap: usize,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    /// Otherwise items left peek-locked by a previous process are returned to
    /// the front of their queue; that process must no longer be running.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        Self::new_with_cap(root, reset_on_create, 4_096)
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let store = Self {
            root: path,
            io_lock: Mutex::new(()),
            next_token: AtomicU64::new(1),
            cap,
        };
        if !reset_on_create {
            for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
                if let Err(e) = store.requeue_orphaned_locks(kind) {
                    error!(queue = ?kind, error = %e, "failed to recover locked work items");
                }
            }
        }
        store
    }

    /// Move every lock sidecar of `kind` back to the head of its queue.
    /// Runs before the store is shared, so it uses blocking IO.
    fn requeue_orphaned_locks(&self, kind: QueueKind) -> Result<(), ProviderError> {
        let mut locks: Vec<PathBuf> = match std::fs::read_dir(self.lock_dir(kind)) {
            Ok(rd) => rd
                .filter_map(|ent| ent.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "lock"))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if locks.is_empty() {
            return Ok(());
        }
        locks.sort();

        let qf = self.queue_file(kind);
        let existing = match std::fs::read_to_string(&qf) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut buf = String::new();
        let mut recovered = 0usize;
        for lock in &locks {
            let line = std::fs::read_to_string(lock)?;
            match serde_json::from_str::<WorkItem>(line.trim()) {
                Ok(item) => {
                    let line = serde_json::to_string(&item)?;
                    // Already queued again while it was locked
                    if existing.lines().any(|l| l == line) {
                        continue;
                    }
                    buf.push_str(&line);
                    buf.push('\n');
                    recovered += 1;
                }
                Err(e) => {
                    error!(queue = ?kind, lock = %lock.display(), error = %e, "malformed lock file; moving it aside");
                    self.reject_lines_blocking(kind, &[line.trim().to_string()])?;
                }
            }
        }
        buf.push_str(&existing);
        if let Some(parent) = qf.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = qf.with_extension("jsonl.tmp");
        std::fs::write(&tmp, buf)?;
        std::fs::rename(&tmp, &qf)?;
        for lock in &locks {
            std::fs::remove_file(lock)?;
        }
        warn!(queue = ?kind, recovered, "returned orphaned locked work items to the queue");
        Ok(())
    }

    fn rejected_file(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join("queues/orch.rejected.jsonl"),
            QueueKind::Worker => self.root.join("queues/work.rejected.jsonl"),
        }
    }

    fn reject_lines_blocking(&self, kind: QueueKind, lines: &[String]) -> Result<(), ProviderError> {
        use std::io::Write;
        let path = self.rejected_file(kind);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }
    fn inst_path(&self, instance: &str) -> PathBuf {
        self.instances_dir().join(format!("{instance}.jsonl"))
    }
    fn queue_file(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join("queues/orch.jsonl"),
            QueueKind::Worker => self.root.join("queues/work.jsonl"),
        }
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join("locks/orch"),
            QueueKind::Worker => self.root.join("locks/work"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn lease_path(&self, instance: &str) -> PathBuf {
        self.root.join("leases").join(format!("{instance}.json"))
    }

    async fn read_unlocked(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let path = self.inst_path(instance);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::InstanceNotFound(instance.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<Event>(line).map_err(|e| ProviderError::Corrupt {
                instance: instance.to_string(),
                line: n + 1,
                reason: e.to_string(),
            })?;
            out.push(ev);
        }
        Ok(out)
    }

    async fn read_queue(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        let content = match fs::read_to_string(self.queue_file(kind)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        let mut rejected = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkItem>(line) {
                Ok(item) => items.push(item),
                Err(e) => {
                    error!(queue = ?kind, line = n + 1, error = %e, "malformed queue entry; moving it aside");
                    rejected.push(line.to_string());
                }
            }
        }
        if !rejected.is_empty() {
            let path = self.rejected_file(kind);
            let mut buf = String::new();
            for line in &rejected {
                buf.push_str(line);
                buf.push('\n');
            }
            let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(buf.as_bytes()).await?;
            file.flush().await?;
            self.write_queue(kind, &items).await?;
        }
        Ok(items)
    }

    async fn read_locked(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        let mut rd = match fs::read_dir(self.lock_dir(kind)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut items = Vec::new();
        while let Some(ent) = rd.next_entry().await? {
            let data = match fs::read_to_string(ent.path()).await {
                Ok(d) => d,
                // Acked or abandoned concurrently
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str::<WorkItem>(data.trim()) {
                Ok(item) => items.push(item),
                Err(e) => warn!(queue = ?kind, lock = %ent.path().display(), error = %e, "unreadable lock file"),
            }
        }
        Ok(items)
    }

    async fn peek_lock_unlocked(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut items = self.read_queue(kind).await?;
        if items.is_empty() {
            return Ok(None);
        }
        let first = items.remove(0);
        // Persist the locked item before dropping it from the queue
        let token = format!(
            "{:x}-{:x}-{:x}",
            now_ms(),
            std::process::id(),
            self.next_token.fetch_add(1, Ordering::Relaxed)
        );
        fs::create_dir_all(self.lock_dir(kind)).await?;
        fs::write(self.lock_path(kind, &token), serde_json::to_string(&first)?).await?;
        self.write_queue(kind, &items).await?;
        Ok(Some((first, token)))
    }

    /// Rewrite a queue file atomically via a temp file and rename.
    async fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), ProviderError> {
        let qf = self.queue_file(kind);
        if let Some(parent) = qf.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut buf = String::new();
        for it in items {
            buf.push_str(&serde_json::to_string(it)?);
            buf.push('\n');
        }
        let tmp = qf.with_extension("jsonl.tmp");
        fs::write(&tmp, buf).await?;
        fs::rename(&tmp, &qf).await?;
        Ok(())
    }

    async fn list_unlocked(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(self.instances_dir()).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str()
                    && let Some(stem) = name.strip_suffix(".jsonl")
                {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        out
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        fs::create_dir_all(self.instances_dir()).await?;
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.inst_path(instance))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ProviderError::InstanceExists(instance.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        match fs::remove_file(self.inst_path(instance)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::InstanceNotFound(instance.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the entire JSONL file for the instance. A line that does not
    /// deserialize is reported as corruption, never skipped.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let _g = self.io_lock.lock().await;
        self.read_unlocked(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        let existing = self.read_unlocked(instance).await?;
        check_append(instance, &existing, &new_events, self.cap)?;
        let mut buf = String::new();
        for ev in &new_events {
            buf.push_str(&serde_json::to_string(ev)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new().append(true).open(self.inst_path(instance)).await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let _g = self.io_lock.lock().await;
        self.list_unlocked().await
    }

    async fn dump_all_pretty(&self) -> String {
        let _g = self.io_lock.lock().await;
        let mut out = String::new();
        for inst in self.list_unlocked().await {
            out.push_str(&format!("instance={inst}\n"));
            match self.read_unlocked(&inst).await {
                Ok(events) => {
                    for ev in events {
                        out.push_str(&format!("  {ev:?}\n"));
                    }
                }
                Err(e) => out.push_str(&format!("  <unreadable: {e}>\n")),
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        let mut items = self.read_queue(kind).await?;
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.io_lock.lock().await;
        match self.peek_lock_unlocked(kind).await {
            Ok(next) => next,
            Err(e) => {
                error!(queue = ?kind, error = %e, "failed to dequeue work item");
                None
            }
        }
    }

    async fn outstanding_work(&self, instance: &str) -> Result<Vec<WorkItem>, ProviderError> {
        let _g = self.io_lock.lock().await;
        let mut out = Vec::new();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
            out.extend(self.read_queue(kind).await?);
            out.extend(self.read_locked(kind).await?);
        }
        out.retain(|item| item.instance() == instance);
        Ok(out)
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        match fs::remove_file(self.lock_path(kind, token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        let path = self.lock_path(kind, token);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let item: WorkItem = serde_json::from_str(&data)?;
        let mut items = self.read_queue(kind).await?;
        items.insert(0, item);
        self.write_queue(kind, &items).await?;
        fs::remove_file(&path).await?;
        Ok(())
    }

    async fn try_acquire_lease(&self, instance: &str, owner: &str, ttl: Duration) -> Result<bool, ProviderError> {
        let _g = self.io_lock.lock().await;
        let path = self.lease_path(instance);
        let now = now_ms();
        match fs::read_to_string(&path).await {
            Ok(data) => {
                let current: LeaseRecord = serde_json::from_str(&data)?;
                if current.owner != owner && current.expires_at_ms > now {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let record = LeaseRecord {
            owner: owner.to_string(),
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
        };
        fs::write(&path, serde_json::to_string(&record)?).await?;
        Ok(true)
    }

    async fn release_lease(&self, instance: &str, owner: &str) -> Result<(), ProviderError> {
        let _g = self.io_lock.lock().await;
        let path = self.lease_path(instance);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let current: LeaseRecord = serde_json::from_str(&data)?;
        if current.owner == owner {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
