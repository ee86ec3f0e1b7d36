use crate::_typed_codec::{Codec, Json};
use crate::error::ActivityError;
use crate::source::{BatchFetcher, StatusResolver};
use crate::{ActivityKind, TransactionRef};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes one activity attempt. Retries are applied by the caller.
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    async fn execute(&self, kind: ActivityKind, input: String) -> Result<String, ActivityError>;
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

/// Immutable mapping from activity kind to handler.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<ActivityKind, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<ActivityKind, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    /// Registry wired to a batch source and a status resolver.
    pub fn for_sources(fetcher: Arc<dyn BatchFetcher>, resolver: Arc<dyn StatusResolver>) -> Self {
        Self::builder().with_fetcher(fetcher).with_resolver(resolver).build()
    }

    pub fn get(&self, kind: ActivityKind) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(&kind).cloned()
    }
}

#[async_trait]
impl ActivityExecutor for ActivityRegistry {
    async fn execute(&self, kind: ActivityKind, input: String) -> Result<String, ActivityError> {
        match self.get(kind) {
            Some(handler) => handler.invoke(input).await,
            None => Err(ActivityError::permanent(format!("unregistered:{kind}"))),
        }
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, kind: ActivityKind, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(kind, Arc::new(FnActivity(f)));
        self
    }

    /// Register a handler over typed payloads. Undecodable input and
    /// unencodable output are permanent failures.
    pub fn register_typed<In, Out, F, Fut>(mut self, kind: ActivityKind, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In =
                    Json::decode(&input_s).map_err(|e| ActivityError::permanent(format!("bad input: {e}")))?;
                let out: Out = (f_inner)(input).await?;
                Json::encode(&out).map_err(|e| ActivityError::permanent(format!("bad output: {e}")))
            }
        };
        self.map.insert(kind, Arc::new(FnActivity(wrapper)));
        self
    }

    /// Route `FetchBatch` to a source. The input is the decimal record limit;
    /// a source that over-delivers is truncated to it.
    pub fn with_fetcher(self, fetcher: Arc<dyn BatchFetcher>) -> Self {
        self.register(ActivityKind::FetchBatch, move |input: String| {
            let fetcher = fetcher.clone();
            async move {
                let max_records: usize = input
                    .trim()
                    .parse()
                    .map_err(|e| ActivityError::permanent(format!("bad max_records {input:?}: {e}")))?;
                let mut records = fetcher.fetch(max_records).await?;
                if records.len() > max_records {
                    warn!(returned = records.len(), max_records, "batch source over-delivered; truncating");
                    records.truncate(max_records);
                }
                debug!(count = records.len(), "batch fetched");
                Json::encode(&records).map_err(|e| ActivityError::permanent(format!("bad batch: {e}")))
            }
        })
    }

    pub fn with_resolver(self, resolver: Arc<dyn StatusResolver>) -> Self {
        self.register_typed(ActivityKind::ResolveStatus, move |txn: TransactionRef| {
            let resolver = resolver.clone();
            async move {
                info!(transaction = %txn.id, charge = %txn.charge_id, "resolving order status for transaction");
                resolver.resolve(&txn).await
            }
        })
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
