//! In-memory shard→executor cache, kept live by the store's change
//! subscription.
//!
//! The cache is process-wide state with an explicit lifecycle: created
//! once at wire-up, passed as a dependency, stopped at process exit.
//! Per-namespace sub-caches are created lazily on first use; each owns
//! its own lock, subscription, and refresh task.

use crate::error::StoreError;
use crate::store::{EventType, StateWatch};
use crate::types::{ExecutorId, NamespaceState, ShardKey, ShardOwner};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Process-wide shard→executor cache over all namespaces.
pub struct ShardToExecutorCache {
    source: Arc<dyn StateWatch>,
    namespaces: RwLock<HashMap<String, Arc<NamespaceCache>>>,
    stop: CancellationToken,
}

impl ShardToExecutorCache {
    /// Create a cache over the given state source. Namespace sub-caches
    /// are created lazily.
    pub fn new(source: Arc<dyn StateWatch>) -> Self {
        Self {
            source,
            namespaces: RwLock::new(HashMap::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Stop every namespace refresh task.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolve the owner of a shard. A miss forces one synchronous
    /// refresh before failing with `ShardNotFound`.
    pub async fn get_shard_owner(
        &self,
        namespace: &str,
        shard_key: &str,
    ) -> Result<ShardOwner, StoreError> {
        let cache = self.namespace_cache(namespace).await?;
        cache.get_shard_owner(shard_key).await
    }

    /// Snapshot of each cached executor's `assigned_state` revision at
    /// the last refresh. The store's single-shard fast path compares all
    /// of them, so a stale cache can never let an assignment slip past a
    /// concurrent change.
    pub async fn executor_revisions(
        &self,
        namespace: &str,
    ) -> Result<HashMap<ExecutorId, i64>, StoreError> {
        let cache = self.namespace_cache(namespace).await?;
        Ok(cache.executor_revisions())
    }

    async fn namespace_cache(&self, namespace: &str) -> Result<Arc<NamespaceCache>, StoreError> {
        if let Some(cache) = self.namespaces.read().get(namespace) {
            return Ok(cache.clone());
        }

        let created =
            NamespaceCache::new(namespace, self.source.clone(), self.stop.child_token()).await?;

        // Another caller may have raced the creation; keep the first one.
        let mut namespaces = self.namespaces.write();
        if let Some(existing) = namespaces.get(namespace) {
            created.shutdown();
            return Ok(existing.clone());
        }
        namespaces.insert(namespace.to_string(), created.clone());
        info!(namespace, "created namespace shard cache");
        Ok(created)
    }
}

#[derive(Default)]
struct NamespaceCacheInner {
    shard_to_executor: HashMap<ShardKey, ShardOwner>,
    executor_revision: HashMap<ExecutorId, i64>,
}

/// Cache of one namespace's shard ownership.
struct NamespaceCache {
    namespace: String,
    source: Arc<dyn StateWatch>,
    inner: RwLock<NamespaceCacheInner>,
    token: CancellationToken,
}

impl NamespaceCache {
    async fn new(
        namespace: &str,
        source: Arc<dyn StateWatch>,
        token: CancellationToken,
    ) -> Result<Arc<Self>, StoreError> {
        let events = source.subscribe(namespace).await?;
        let cache = Arc::new(Self {
            namespace: namespace.to_string(),
            source,
            inner: RwLock::new(NamespaceCacheInner::default()),
            token: token.clone(),
        });

        let refresher = cache.clone();
        tokio::spawn(async move { refresher.refresh_loop(events).await });

        Ok(cache)
    }

    fn shutdown(&self) {
        self.token.cancel();
    }

    async fn get_shard_owner(&self, shard_key: &str) -> Result<ShardOwner, StoreError> {
        if let Some(owner) = self.inner.read().shard_to_executor.get(shard_key) {
            return Ok(owner.clone());
        }

        self.refresh().await?;

        if let Some(owner) = self.inner.read().shard_to_executor.get(shard_key) {
            return Ok(owner.clone());
        }
        Err(StoreError::ShardNotFound {
            shard_key: shard_key.to_string(),
        })
    }

    fn executor_revisions(&self) -> HashMap<ExecutorId, i64> {
        self.inner.read().executor_revision.clone()
    }

    async fn refresh_loop(self: Arc<Self>, mut events: mpsc::Receiver<crate::store::NamespaceEvent>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                maybe = events.recv() => {
                    let Some(event) = maybe else { return };
                    if !event.has_event(EventType::ExecutorAssignedShardsChanged)
                        && !event.has_event(EventType::DeleteExecutors)
                    {
                        continue;
                    }
                    debug!(namespace = %self.namespace, revision = event.revision, "refreshing shard cache");
                    if let Err(e) = self.refresh().await {
                        error!(namespace = %self.namespace, error = %e, "shard cache refresh failed");
                    }
                }
            }
        }
    }

    /// Rebuild both maps from a fresh snapshot. Shards of deleted
    /// executors drop out here.
    async fn refresh(&self) -> Result<(), StoreError> {
        let state = self.source.get_state(&self.namespace).await?;
        let (shard_to_executor, executor_revision) = Self::rebuild(&state);

        let mut inner = self.inner.write();
        inner.shard_to_executor = shard_to_executor;
        inner.executor_revision = executor_revision;
        Ok(())
    }

    fn rebuild(
        state: &NamespaceState,
    ) -> (HashMap<ShardKey, ShardOwner>, HashMap<ExecutorId, i64>) {
        let mut shard_to_executor = HashMap::new();
        let mut executor_revision = HashMap::new();

        for (executor_id, assigned) in &state.shard_assignments {
            executor_revision.insert(executor_id.clone(), assigned.mod_revision);

            let metadata = state
                .executors
                .get(executor_id)
                .map(|heartbeat| heartbeat.metadata.clone())
                .unwrap_or_default();
            for shard_key in assigned.assigned_shards.keys() {
                shard_to_executor.insert(
                    shard_key.clone(),
                    ShardOwner {
                        executor_id: executor_id.clone(),
                        metadata: metadata.clone(),
                    },
                );
            }
        }

        (shard_to_executor, executor_revision)
    }
}
