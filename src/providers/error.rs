use thiserror::Error;

/// Storage-level failures reported by a `HistoryStore`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance already exists: {0}")]
    InstanceExists(String),
    #[error("history of {0} is closed by a terminal entry")]
    HistoryClosed(String),
    #[error("history cap exceeded (cap={cap}, have={have}, append={append})")]
    CapExceeded { cap: usize, have: usize, append: usize },
    #[error("corrupt entry in {instance} at line {line}: {reason}")]
    Corrupt {
        instance: String,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::InstanceNotFound(_))
    }
}
