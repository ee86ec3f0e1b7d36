//! Batch sources and status resolvers: the external collaborators the
//! activities delegate to.
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

use crate::error::ActivityError;
use crate::options::SourceConfig;
use crate::{OrderStatus, StatusResolution, TransactionRef};

/// Retrieves up to `max_records` transactions in one call.
#[async_trait]
pub trait BatchFetcher: Send + Sync {
    async fn fetch(&self, max_records: usize) -> Result<Vec<TransactionRef>, ActivityError>;
}

/// Resolves the order status of a single transaction.
#[async_trait]
pub trait StatusResolver: Send + Sync {
    async fn resolve(&self, transaction: &TransactionRef) -> Result<StatusResolution, ActivityError>;
}

/// Fixed in-memory batch source, mostly for tests and demos.
pub struct InMemoryTransactionSource {
    config: SourceConfig,
    records: Vec<TransactionRef>,
}

impl InMemoryTransactionSource {
    pub fn new(config: SourceConfig, records: Vec<TransactionRef>) -> Self {
        Self { config, records }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }
}

#[async_trait]
impl BatchFetcher for InMemoryTransactionSource {
    async fn fetch(&self, max_records: usize) -> Result<Vec<TransactionRef>, ActivityError> {
        debug!(collection = %self.config.collection, max_records, "fetching in-memory transactions");
        Ok(self.records.iter().take(max_records).cloned().collect())
    }
}

/// Reads transactions from `{endpoint}/{database}/{collection}.jsonl`, one JSON
/// record per line, and returns the first `max_records`.
pub struct FileTransactionSource {
    config: SourceConfig,
}

impl FileTransactionSource {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.config.endpoint)
            .join(&self.config.database)
            .join(format!("{}.jsonl", self.config.collection))
    }
}

#[async_trait]
impl BatchFetcher for FileTransactionSource {
    async fn fetch(&self, max_records: usize) -> Result<Vec<TransactionRef>, ActivityError> {
        let path = self.path();
        info!(path = %path.display(), max_records, "fetching transactions from store");
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ActivityError::permanent(format!("collection not found: {}", path.display())));
            }
            Err(e) => return Err(ActivityError::transient(format!("read {}: {e}", path.display()))),
        };
        let mut out = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if out.len() >= max_records {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let record: TransactionRef = serde_json::from_str(line)
                .map_err(|e| ActivityError::permanent(format!("malformed record at line {}: {e}", n + 1)))?;
            out.push(record);
        }
        Ok(out)
    }
}

/// Sample resolver that derives a status from the minute of the transaction's
/// creation time (`minute % 4 + 1`). A stand-in for a real order service.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinuteBucketResolver;

impl MinuteBucketResolver {
    pub fn status_for(created_at_ms: u64) -> OrderStatus {
        let minute = (created_at_ms / 60_000) % 60;
        // minute % 4 + 1 is always within 1..=4
        OrderStatus::from_ordinal((minute % 4 + 1) as u8).unwrap_or(OrderStatus::Received)
    }
}

#[async_trait]
impl StatusResolver for MinuteBucketResolver {
    async fn resolve(&self, transaction: &TransactionRef) -> Result<StatusResolution, ActivityError> {
        info!(transaction = %transaction.id, "getting order details");
        Ok(StatusResolution {
            status: Self::status_for(transaction.created_at_ms),
            order_id: transaction.id.clone(),
        })
    }
}
