//! Durable store of executors, heartbeats, and shard assignments.
//!
//! The [`Store`] trait is the full contract used by the distributor,
//! reconciler, and executor handlers. [`StateWatch`] is the narrow
//! subset the shard cache depends on; the concrete store wires itself
//! into the cache at construction, so the cache never sees the full
//! store (and the store's fast path can consult the cache without a
//! reference cycle).
//!
//! Writes that must be conditional on leadership take a [`GuardFunc`]:
//! an opaque decorator that prepends the elector's "still leader"
//! precondition to the transaction before it commits.

pub mod keys;

mod executor_store;

pub use executor_store::{KvExecutorStore, KvStateSource};

use crate::error::StoreError;
use crate::kv::Txn;
use crate::types::{AssignedState, HeartbeatState, NamespaceState, ShardOwner};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A function that applies a transactional precondition (typically "the
/// current leader record is still the one this guard was issued to").
/// Composable: the store adds its own compares after the guard's.
pub type GuardFunc = Arc<dyn Fn(Txn) -> Result<Txn, StoreError> + Send + Sync>;

/// A no-op guard for writes that need no leadership check.
pub fn nop_guard() -> GuardFunc {
    Arc::new(|txn| Ok(txn))
}

/// Request to replace shard assignments with a new namespace state.
#[derive(Debug, Clone, Default)]
pub struct AssignShardsRequest {
    /// The desired assignments. Only executors present in
    /// `new_state.shard_assignments` are written; each write is
    /// conditioned on that executor's `mod_revision`.
    pub new_state: NamespaceState,
}

/// Kind of change observed on a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExecutorStatusChanged,
    ExecutorReportShardsChanged,
    ExecutorAssignedShardsChanged,
    DeleteExecutors,
}

/// A batch of changes observed on a namespace. Bursts are collapsed:
/// undelivered batches merge their event-type sets and keep the newest
/// revision. Heartbeat-only updates never produce an event.
#[derive(Debug, Clone)]
pub struct NamespaceEvent {
    pub events: Vec<EventType>,
    pub revision: i64,
}

impl NamespaceEvent {
    /// True if the batch contains the given event type.
    pub fn has_event(&self, event: EventType) -> bool {
        self.events.contains(&event)
    }

    pub(crate) fn merge(&mut self, other: NamespaceEvent) {
        for event in other.events {
            if !self.events.contains(&event) {
                self.events.push(event);
            }
        }
        self.revision = self.revision.max(other.revision);
    }
}

/// The narrow capability the shard cache is built against: snapshot reads
/// plus a change subscription.
#[async_trait]
pub trait StateWatch: Send + Sync + 'static {
    /// Range-read the entire executor prefix of a namespace, grouped by
    /// executor, stamped with the backend's global revision at read time.
    /// Unknown key fragments are ignored.
    async fn get_state(&self, namespace: &str) -> Result<NamespaceState, StoreError>;

    /// Subscribe to significant changes on a namespace. The channel has
    /// capacity 1; see [`NamespaceEvent`] for the collapsing rules.
    async fn subscribe(&self, namespace: &str)
        -> Result<mpsc::Receiver<NamespaceEvent>, StoreError>;
}

/// Composite storage contract for the shard distribution service.
#[async_trait]
pub trait Store: StateWatch {
    /// Atomically write the executor-authored keys (heartbeat timestamp,
    /// status, reported shards, metadata). Never touches `assigned_state`.
    /// Creates the executor implicitly if absent.
    async fn record_heartbeat(
        &self,
        namespace: &str,
        executor_id: &str,
        state: HeartbeatState,
    ) -> Result<(), StoreError>;

    /// Read a single executor's heartbeat projection and assignment.
    async fn get_heartbeat(
        &self,
        namespace: &str,
        executor_id: &str,
    ) -> Result<(HeartbeatState, AssignedState), StoreError>;

    /// Write one `assigned_state` per executor mentioned in the request,
    /// each conditioned on its stored `mod_revision`, all under the
    /// leader guard. Empty requests succeed without writing.
    async fn assign_shards(
        &self,
        namespace: &str,
        request: AssignShardsRequest,
        guard: GuardFunc,
    ) -> Result<(), StoreError>;

    /// Single-shard fast path used outside the reconciler (on-demand
    /// ephemeral shards). Retries version conflicts indefinitely; cancel
    /// the future to stop.
    async fn assign_shard(
        &self,
        namespace: &str,
        shard_key: &str,
        executor_id: &str,
    ) -> Result<(), StoreError>;

    /// Resolve the owner of a shard.
    async fn get_shard_owner(
        &self,
        namespace: &str,
        shard_key: &str,
    ) -> Result<ShardOwner, StoreError>;

    /// Delete all keys of the listed executors under the leader guard.
    /// Non-existent executors are silently ignored; assignments persisted
    /// on other executors are untouched.
    async fn delete_executors(
        &self,
        namespace: &str,
        executor_ids: &[String],
        guard: GuardFunc,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_event_merge() {
        let mut event = NamespaceEvent {
            events: vec![EventType::ExecutorStatusChanged],
            revision: 5,
        };
        event.merge(NamespaceEvent {
            events: vec![
                EventType::ExecutorStatusChanged,
                EventType::ExecutorAssignedShardsChanged,
            ],
            revision: 7,
        });

        assert_eq!(event.revision, 7);
        assert_eq!(event.events.len(), 2);
        assert!(event.has_event(EventType::ExecutorAssignedShardsChanged));
        assert!(!event.has_event(EventType::DeleteExecutors));
    }

    #[test]
    fn test_nop_guard_passes_txn_through() {
        let guard = nop_guard();
        let txn = Txn::new();
        let guarded = guard(txn).unwrap();
        assert!(guarded.compares.is_empty());
    }
}
