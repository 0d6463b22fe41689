//! KV-backed implementation of the [`Store`] contract.

use super::keys::{self, ExecutorKeyPart};
use super::{
    AssignShardsRequest, EventType, GuardFunc, NamespaceEvent, StateWatch, Store,
};
use crate::cache::ShardToExecutorCache;
use crate::error::StoreError;
use crate::kv::{Compare, KvStore, Op, Txn, WatchEventKind};
use crate::types::{
    AssignedState, ExecutorStatus, HeartbeatState, NamespaceState, ShardAssignment, ShardOwner,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn active_status_json() -> String {
    format!("\"{}\"", ExecutorStatus::Active)
}

/// Snapshot/subscription source over the KV backend. This is the narrow
/// [`StateWatch`] capability the shard cache is constructed with; it
/// carries no reference back to the store.
pub struct KvStateSource {
    kv: Arc<dyn KvStore>,
    prefix: String,
    stop: CancellationToken,
}

impl KvStateSource {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            stop: CancellationToken::new(),
        }
    }

    fn decode_state(
        &self,
        namespace: &str,
        kvs: &[crate::kv::KeyValue],
        revision: i64,
    ) -> Result<NamespaceState, StoreError> {
        let mut state = NamespaceState {
            global_revision: revision,
            ..Default::default()
        };

        for kv in kvs {
            let Some((executor_id, part)) = keys::parse_executor_key(&self.prefix, namespace, &kv.key)
            else {
                continue;
            };
            let heartbeat = state.executors.entry(executor_id.clone()).or_default();
            let assigned = state.shard_assignments.entry(executor_id).or_default();

            match part {
                ExecutorKeyPart::Heartbeat => {
                    heartbeat.last_heartbeat = kv.value.parse().unwrap_or(0);
                }
                ExecutorKeyPart::Status => {
                    heartbeat.status = serde_json::from_str(&kv.value)?;
                }
                ExecutorKeyPart::ReportedShards => {
                    heartbeat.reported_shards = serde_json::from_str(&kv.value)?;
                }
                ExecutorKeyPart::AssignedState => {
                    *assigned = serde_json::from_str(&kv.value)?;
                    assigned.mod_revision = kv.mod_revision;
                }
                ExecutorKeyPart::Metadata(meta_key) => {
                    heartbeat.metadata.insert(meta_key, kv.value.clone());
                }
            }
        }

        Ok(state)
    }

    /// Map one raw watch batch to namespace event types. Heartbeat and
    /// metadata writes are filtered at the source: they arrive with every
    /// heartbeat tick and would otherwise dominate the stream.
    fn classify(&self, namespace: &str, batch: &crate::kv::WatchBatch) -> Vec<EventType> {
        let mut events = Vec::new();
        let mut push = |event: EventType| {
            if !events.contains(&event) {
                events.push(event);
            }
        };

        for event in &batch.events {
            if event.kind == WatchEventKind::Delete {
                push(EventType::DeleteExecutors);
                continue;
            }
            match keys::parse_executor_key(&self.prefix, namespace, &event.key) {
                Some((_, ExecutorKeyPart::Status)) => push(EventType::ExecutorStatusChanged),
                Some((_, ExecutorKeyPart::ReportedShards)) => {
                    push(EventType::ExecutorReportShardsChanged)
                }
                Some((_, ExecutorKeyPart::AssignedState)) => {
                    push(EventType::ExecutorAssignedShardsChanged)
                }
                Some((_, ExecutorKeyPart::Heartbeat | ExecutorKeyPart::Metadata(_))) | None => {}
            }
        }
        events
    }
}

#[async_trait]
impl StateWatch for KvStateSource {
    async fn get_state(&self, namespace: &str) -> Result<NamespaceState, StoreError> {
        let executor_prefix = keys::executor_prefix(&self.prefix, namespace);
        let resp = self.kv.range(&executor_prefix).await?;
        self.decode_state(namespace, &resp.kvs, resp.revision)
    }

    async fn subscribe(
        &self,
        namespace: &str,
    ) -> Result<mpsc::Receiver<NamespaceEvent>, StoreError> {
        let executor_prefix = keys::executor_prefix(&self.prefix, namespace);
        let mut watch = self.kv.watch_prefix(&executor_prefix).await?;

        let (tx, rx) = mpsc::channel(1);
        let source = KvStateSource {
            kv: self.kv.clone(),
            prefix: self.prefix.clone(),
            stop: self.stop.clone(),
        };
        let namespace = namespace.to_string();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let mut pending: Option<NamespaceEvent> = None;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tx.closed() => return,
                    maybe = watch.recv() => {
                        let Some(batch) = maybe else { return };
                        let events = source.classify(&namespace, &batch);
                        if events.is_empty() {
                            continue;
                        }
                        let event = NamespaceEvent { events, revision: batch.revision };
                        match pending.as_mut() {
                            Some(p) => p.merge(event),
                            None => pending = Some(event),
                        }
                    }
                    permit = tx.reserve(), if pending.is_some() => {
                        let Ok(permit) = permit else { return };
                        permit.send(pending.take().unwrap());
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// KV-backed executor store. Owns the process-wide shard cache; the
/// cache itself only sees the narrow [`KvStateSource`].
pub struct KvExecutorStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    source: Arc<KvStateSource>,
    cache: Arc<ShardToExecutorCache>,
}

impl KvExecutorStore {
    /// Create the store and its shard cache over a KV backend.
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Arc<Self> {
        let prefix = prefix.into();
        let source = Arc::new(KvStateSource::new(kv.clone(), prefix.clone()));
        let cache = Arc::new(ShardToExecutorCache::new(source.clone() as Arc<dyn StateWatch>));
        Arc::new(Self {
            kv,
            prefix,
            source,
            cache,
        })
    }

    /// The process-wide shard cache backed by this store.
    pub fn shard_cache(&self) -> Arc<ShardToExecutorCache> {
        self.cache.clone()
    }

    /// Stop the cache refresh and subscription relay tasks.
    pub fn stop(&self) {
        self.cache.stop();
        self.source.stop.cancel();
    }

    fn assigned_state_key(&self, namespace: &str, executor_id: &str) -> String {
        keys::executor_key(&self.prefix, namespace, executor_id, keys::ASSIGNED_STATE_KEY)
    }
}

#[async_trait]
impl StateWatch for KvExecutorStore {
    async fn get_state(&self, namespace: &str) -> Result<NamespaceState, StoreError> {
        self.source.get_state(namespace).await
    }

    async fn subscribe(
        &self,
        namespace: &str,
    ) -> Result<mpsc::Receiver<NamespaceEvent>, StoreError> {
        self.source.subscribe(namespace).await
    }
}

#[async_trait]
impl Store for KvExecutorStore {
    async fn record_heartbeat(
        &self,
        namespace: &str,
        executor_id: &str,
        state: HeartbeatState,
    ) -> Result<(), StoreError> {
        let heartbeat_key =
            keys::executor_key(&self.prefix, namespace, executor_id, keys::HEARTBEAT_KEY);
        let status_key = keys::executor_key(&self.prefix, namespace, executor_id, keys::STATUS_KEY);
        let reported_key = keys::executor_key(
            &self.prefix,
            namespace,
            executor_id,
            keys::REPORTED_SHARDS_KEY,
        );

        let status_json = serde_json::to_string(&state.status)?;
        let reported_json = serde_json::to_string(&state.reported_shards)?;

        // Only rewrite keys whose value actually changed. Heartbeats are
        // the dominant write; a tick that changes nothing but the
        // timestamp must not ripple through the subscription stream.
        let scope = keys::executor_scope(&self.prefix, namespace, executor_id);
        let current: std::collections::HashMap<String, String> = self
            .kv
            .range(&scope)
            .await?
            .kvs
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();
        let changed = |key: &str, value: &str| current.get(key).map(String::as_str) != Some(value);

        let mut txn = Txn::new().and_then(Op::put(
            heartbeat_key,
            state.last_heartbeat.to_string(),
        ));
        if changed(&status_key, &status_json) {
            txn = txn.and_then(Op::put(status_key, status_json));
        }
        if changed(&reported_key, &reported_json) {
            txn = txn.and_then(Op::put(reported_key, reported_json));
        }
        for (meta_key, value) in &state.metadata {
            let key = keys::metadata_key(&self.prefix, namespace, executor_id, meta_key);
            if changed(&key, value) {
                txn = txn.and_then(Op::put(key, value.clone()));
            }
        }

        self.kv.commit(txn).await?;
        Ok(())
    }

    async fn get_heartbeat(
        &self,
        namespace: &str,
        executor_id: &str,
    ) -> Result<(HeartbeatState, AssignedState), StoreError> {
        let scope = keys::executor_scope(&self.prefix, namespace, executor_id);
        let resp = self.kv.range(&scope).await?;
        if resp.kvs.is_empty() {
            return Err(StoreError::ExecutorNotFound {
                executor_id: executor_id.to_string(),
            });
        }

        let state = self.source.decode_state(namespace, &resp.kvs, resp.revision)?;
        let heartbeat = state
            .executors
            .get(executor_id)
            .cloned()
            .ok_or_else(|| StoreError::ExecutorNotFound {
                executor_id: executor_id.to_string(),
            })?;
        let assigned = state
            .shard_assignments
            .get(executor_id)
            .cloned()
            .unwrap_or_default();
        Ok((heartbeat, assigned))
    }

    async fn assign_shards(
        &self,
        namespace: &str,
        request: AssignShardsRequest,
        guard: GuardFunc,
    ) -> Result<(), StoreError> {
        let mut inner = Txn::new();
        for (executor_id, state) in &request.new_state.shard_assignments {
            let key = self.assigned_state_key(namespace, executor_id);
            let value = serde_json::to_string(state)?;
            inner = inner
                .when(Compare::mod_revision(&key, state.mod_revision))
                .and_then(Op::put(key, value));
        }

        if inner.success.is_empty() {
            return Ok(());
        }

        // The outer transaction carries the leadership guard; the
        // per-executor revision checks ride inside a nested transaction so
        // the two failure modes stay distinguishable.
        let outer = guard(Txn::new())?.and_then(Op::Txn(inner));
        let resp = self.kv.commit(outer).await?;

        if !resp.succeeded {
            return Err(StoreError::VersionConflict(
                "transaction failed, leadership may have changed".to_string(),
            ));
        }
        let nested = resp.nested().ok_or_else(|| {
            StoreError::VersionConflict("unexpected empty response from transaction".to_string())
        })?;
        if !nested.succeeded {
            return Err(StoreError::VersionConflict(
                "transaction failed, a shard may have been concurrently assigned".to_string(),
            ));
        }
        Ok(())
    }

    async fn assign_shard(
        &self,
        namespace: &str,
        shard_key: &str,
        executor_id: &str,
    ) -> Result<(), StoreError> {
        let assigned_key = self.assigned_state_key(namespace, executor_id);
        let status_key = keys::executor_key(&self.prefix, namespace, executor_id, keys::STATUS_KEY);

        // Read-modify-write loop; a version conflict re-reads and retries
        // until the caller cancels.
        loop {
            let current = self.kv.get(&assigned_key).await?;
            let (mut state, mod_revision) = match &current {
                Some(kv) => (
                    serde_json::from_str::<AssignedState>(&kv.value)?,
                    kv.mod_revision,
                ),
                None => (AssignedState::default(), 0),
            };
            state
                .assigned_shards
                .entry(shard_key.to_string())
                .or_insert_with(ShardAssignment::ready);
            let new_value = serde_json::to_string(&state)?;

            // The shard may already have an owner; the cache refreshes on
            // miss, so this also brings its revision map up to date.
            match self.cache.get_shard_owner(namespace, shard_key).await {
                Ok(owner) => {
                    return Err(StoreError::ShardAlreadyAssigned {
                        shard_key: shard_key.to_string(),
                        assigned_to: owner.executor_id,
                    })
                }
                Err(StoreError::ShardNotFound { .. }) => {}
                Err(e) => return Err(e),
            }

            let mut txn = Txn::new()
                .when(Compare::value(&status_key, active_status_json()))
                .when(Compare::mod_revision(&assigned_key, mod_revision));

            // One revision check per cached executor: the write cannot
            // succeed while the cache is stale with respect to any of them.
            for (cached_executor, revision) in self.cache.executor_revisions(namespace).await? {
                if cached_executor == executor_id {
                    continue;
                }
                txn = txn.when(Compare::mod_revision(
                    self.assigned_state_key(namespace, &cached_executor),
                    revision,
                ));
            }

            let txn = txn.and_then(Op::put(&assigned_key, new_value));
            let resp = self.kv.commit(txn).await?;
            if resp.succeeded {
                return Ok(());
            }

            // Work out whether the status check was the one that failed.
            let status = self.kv.get(&status_key).await?;
            match status {
                None => {
                    return Err(StoreError::ExecutorNotFound {
                        executor_id: executor_id.to_string(),
                    })
                }
                Some(kv) if kv.value != active_status_json() => {
                    return Err(StoreError::VersionConflict(format!(
                        "executor status is {}",
                        kv.value
                    )))
                }
                Some(_) => {}
            }

            info!(
                namespace,
                shard = shard_key,
                executor = executor_id,
                "assign shard transaction conflicted, retrying"
            );
        }
    }

    async fn get_shard_owner(
        &self,
        namespace: &str,
        shard_key: &str,
    ) -> Result<ShardOwner, StoreError> {
        match self.cache.get_shard_owner(namespace, shard_key).await {
            Err(StoreError::ShardNotFound { .. }) => {}
            other => return other,
        }

        // Fallback: authoritative read, covers subscription lag.
        let state = self.get_state(namespace).await?;
        let owner = state
            .owner_of(shard_key)
            .ok_or_else(|| StoreError::ShardNotFound {
                shard_key: shard_key.to_string(),
            })?;
        let metadata = state
            .executors
            .get(owner)
            .map(|heartbeat| heartbeat.metadata.clone())
            .unwrap_or_default();
        Ok(ShardOwner {
            executor_id: owner.clone(),
            metadata,
        })
    }

    async fn delete_executors(
        &self,
        namespace: &str,
        executor_ids: &[String],
        guard: GuardFunc,
    ) -> Result<(), StoreError> {
        if executor_ids.is_empty() {
            return Ok(());
        }

        let mut txn = guard(Txn::new())?;
        for executor_id in executor_ids {
            txn = txn.and_then(Op::delete_prefix(keys::executor_scope(
                &self.prefix,
                namespace,
                executor_id,
            )));
        }

        let resp = self.kv.commit(txn).await?;
        if !resp.succeeded {
            return Err(StoreError::VersionConflict(
                "transaction failed, leadership may have changed".to_string(),
            ));
        }
        info!(namespace, executors = ?executor_ids, "deleted executors");
        Ok(())
    }
}
