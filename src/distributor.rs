//! Service-side composition: the handlers behind both RPC services.

use crate::config::DistributionConfig;
use crate::error::{Error, Result, StoreError};
use crate::metrics::DistributorMetrics;
use crate::rpc::{ShardDistributorApi, ShardDistributorExecutorApi};
use crate::store::{StateWatch, Store};
use crate::types::{
    ExecutorHeartbeatRequest, ExecutorHeartbeatResponse, ExecutorId, GetShardOwnerRequest,
    GetShardOwnerResponse, HeartbeatState, NewEphemeralShardRequest, NewEphemeralShardResponse,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// The distributor service: answers ownership lookups, accepts
/// heartbeats, and assigns ephemeral shards on demand.
pub struct ShardDistributor {
    store: Arc<dyn Store>,
    config: DistributionConfig,
    metrics: Arc<DistributorMetrics>,
}

impl ShardDistributor {
    /// Create a distributor over a store. Fails on invalid configuration.
    pub fn new(store: Arc<dyn Store>, config: DistributionConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        Ok(Self {
            store,
            config,
            metrics: Arc::new(DistributorMetrics::new()),
        })
    }

    /// Process metrics for this distributor.
    pub fn metrics(&self) -> Arc<DistributorMetrics> {
        self.metrics.clone()
    }

    fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if self.config.namespace(namespace).is_none() {
            return Err(Error::NamespaceNotFound {
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// The ACTIVE executor with the fewest assigned shards, ties broken
    /// by id.
    async fn least_loaded_active(&self, namespace: &str) -> Result<ExecutorId> {
        let state = self.store.get_state(namespace).await?;
        state
            .executors
            .iter()
            .filter(|(_, heartbeat)| heartbeat.status.is_assignable())
            .map(|(id, _)| {
                let assigned = state
                    .shard_assignments
                    .get(id)
                    .map(|a| a.assigned_shards.len())
                    .unwrap_or(0);
                (assigned, id.clone())
            })
            .min()
            .map(|(_, id)| id)
            .ok_or_else(|| Error::Unavailable(format!("no active executors in {namespace}")))
    }
}

#[async_trait]
impl ShardDistributorApi for ShardDistributor {
    async fn get_shard_owner(&self, request: GetShardOwnerRequest) -> Result<GetShardOwnerResponse> {
        self.ensure_namespace(&request.namespace)?;
        self.metrics.owner_lookups.inc();

        let owner = self
            .store
            .get_shard_owner(&request.namespace, &request.shard_key)
            .await?;
        Ok(GetShardOwnerResponse {
            namespace: request.namespace,
            owner: owner.executor_id,
        })
    }

    async fn new_ephemeral_shard(
        &self,
        request: NewEphemeralShardRequest,
    ) -> Result<NewEphemeralShardResponse> {
        self.ensure_namespace(&request.namespace)?;

        let candidate = self.least_loaded_active(&request.namespace).await?;
        let owner = match self
            .store
            .assign_shard(&request.namespace, &request.shard_key, &candidate)
            .await
        {
            Ok(()) => {
                self.metrics.ephemeral_assignments.inc();
                info!(
                    namespace = %request.namespace,
                    shard = %request.shard_key,
                    executor = %candidate,
                    "assigned ephemeral shard"
                );
                candidate
            }
            // Raced another creator; the shard has an owner, which is
            // what the caller wanted to exist.
            Err(StoreError::ShardAlreadyAssigned { assigned_to, .. }) => assigned_to,
            Err(e) => return Err(e.into()),
        };

        Ok(NewEphemeralShardResponse {
            namespace: request.namespace,
            owner,
        })
    }
}

#[async_trait]
impl ShardDistributorExecutorApi for ShardDistributor {
    async fn heartbeat(
        &self,
        request: ExecutorHeartbeatRequest,
    ) -> Result<ExecutorHeartbeatResponse> {
        self.ensure_namespace(&request.namespace)?;

        let state = HeartbeatState {
            last_heartbeat: Self::unix_now(),
            status: request.status,
            reported_shards: request.shard_status_reports,
            metadata: request.metadata,
        };
        self.store
            .record_heartbeat(&request.namespace, &request.executor_id, state)
            .await?;
        self.metrics.heartbeats_recorded.inc();

        let (_, assigned) = self
            .store
            .get_heartbeat(&request.namespace, &request.executor_id)
            .await?;
        debug!(
            namespace = %request.namespace,
            executor = %request.executor_id,
            assigned = assigned.assigned_shards.len(),
            "heartbeat"
        );
        Ok(ExecutorHeartbeatResponse {
            shard_assignments: assigned.assigned_shards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::store::KvExecutorStore;
    use crate::types::{ExecutorStatus, ShardReport};
    use std::collections::HashMap;

    fn distributor() -> ShardDistributor {
        let store = KvExecutorStore::new(Arc::new(MemoryKv::new()), "/test");
        let config = DistributionConfig::new("/test")
            .with_fixed_namespace("orders", 4)
            .with_ephemeral_namespace("sessions");
        ShardDistributor::new(store, config).unwrap()
    }

    fn heartbeat_request(namespace: &str, executor_id: &str) -> ExecutorHeartbeatRequest {
        ExecutorHeartbeatRequest {
            namespace: namespace.to_string(),
            executor_id: executor_id.to_string(),
            status: ExecutorStatus::Active,
            shard_status_reports: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_namespace_rejected() {
        let distributor = distributor();

        let err = distributor
            .get_shard_owner(GetShardOwnerRequest {
                namespace: "nope".to_string(),
                shard_key: "s1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound { .. }));

        let err = distributor
            .heartbeat(heartbeat_request("nope", "e1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_returns_empty_assignment_for_new_executor() {
        let distributor = distributor();
        let response = distributor
            .heartbeat(heartbeat_request("orders", "e1"))
            .await
            .unwrap();
        assert!(response.shard_assignments.is_empty());
        assert_eq!(distributor.metrics().snapshot().heartbeats_recorded, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_round_trip() {
        let distributor = distributor();
        let mut request = heartbeat_request("orders", "e1");
        request
            .shard_status_reports
            .insert("0".to_string(), ShardReport::ready(0.7));
        distributor.heartbeat(request).await.unwrap();

        let err = distributor
            .get_shard_owner(GetShardOwnerRequest {
                namespace: "orders".to_string(),
                shard_key: "0".to_string(),
            })
            .await
            .unwrap_err();
        // Reported but not assigned: still unowned.
        assert!(matches!(
            err,
            Error::Store(StoreError::ShardNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_ephemeral_shard_assigns_and_is_idempotent() {
        let distributor = distributor();
        distributor
            .heartbeat(heartbeat_request("sessions", "e1"))
            .await
            .unwrap();

        let response = distributor
            .new_ephemeral_shard(NewEphemeralShardRequest {
                namespace: "sessions".to_string(),
                shard_key: "sess-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.owner, "e1");

        let lookup = distributor
            .get_shard_owner(GetShardOwnerRequest {
                namespace: "sessions".to_string(),
                shard_key: "sess-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(lookup.owner, "e1");

        // A second creation resolves to the existing owner.
        let response = distributor
            .new_ephemeral_shard(NewEphemeralShardRequest {
                namespace: "sessions".to_string(),
                shard_key: "sess-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.owner, "e1");
    }

    #[tokio::test]
    async fn test_new_ephemeral_shard_without_executors() {
        let distributor = distributor();
        let err = distributor
            .new_ephemeral_shard(NewEphemeralShardRequest {
                namespace: "sessions".to_string(),
                shard_key: "sess-1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_ephemeral_shard_prefers_least_loaded() {
        let distributor = distributor();
        distributor
            .heartbeat(heartbeat_request("sessions", "e1"))
            .await
            .unwrap();
        distributor
            .heartbeat(heartbeat_request("sessions", "e2"))
            .await
            .unwrap();

        // Two shards spread over the two executors.
        let first = distributor
            .new_ephemeral_shard(NewEphemeralShardRequest {
                namespace: "sessions".to_string(),
                shard_key: "sess-1".to_string(),
            })
            .await
            .unwrap();
        let second = distributor
            .new_ephemeral_shard(NewEphemeralShardRequest {
                namespace: "sessions".to_string(),
                shard_key: "sess-2".to_string(),
            })
            .await
            .unwrap();
        assert_ne!(first.owner, second.owner);
    }
}
