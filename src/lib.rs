//! Shard-to-executor distribution service.
//!
//! This crate is the control-plane component that tracks a fleet of
//! worker processes ("executors"), owns the mapping from application
//! shard keys to the executor responsible for them, reassigns shards as
//! executors join, drain, or fail, and answers "who owns shard K in
//! namespace N?" on the routing path of every request.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  heartbeat   ┌──────────────────┐
//! │  Executor    │─────────────▶│  ShardDistributor │
//! │  (worker)    │◀─────────────│  (handlers)       │
//! └─────┬────────┘  assignment  └───────┬──────────┘
//!       │ ShardProcessors               │
//!       ▼                               ▼
//! ┌─────────────┐              ┌──────────────────┐
//! │ PeerChooser  │◀── cache ───│   Store (KV)      │◀─┐
//! └─────────────┘              └───────┬──────────┘  │ guard
//!                                      │ subscribe    │
//!                              ┌───────▼──────────┐  │
//!                              │   Reconciler      │──┘
//!                              │  (elected leader) │
//!                              └──────────────────┘
//! ```
//!
//! - The **store** persists executors, heartbeats, and shard assignments
//!   in a transactional KV backend with optimistic concurrency; writes
//!   that require leadership carry an election **guard**.
//! - The **elector** runs a FIFO single-leader election per namespace.
//! - The **reconciler** runs inside the elected leader: it reads state,
//!   asks a pluggable placement policy for a new assignment, and commits
//!   it transactionally.
//! - The **executor client** runs inside every worker: it heartbeats,
//!   reconciles local [`executor::ShardProcessor`] instances to the
//!   server's assignment, and exposes them to the application.
//! - The **shard cache** keeps `shard → executor` lookups local, fed by
//!   the store's change subscription; the **peer chooser** turns shard
//!   keys into network peers with it.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardherd::{
//!     DistributionConfig, KvExecutorStore, MemoryKv, ShardDistributor,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> shardherd::Result<()> {
//! let kv = Arc::new(MemoryKv::new());
//! let store = KvExecutorStore::new(kv, "/shardherd");
//! let config = DistributionConfig::new("/shardherd").with_fixed_namespace("orders", 16);
//! let distributor = ShardDistributor::new(store, config)?;
//! # let _ = distributor;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod distributor;
pub mod election;
pub mod error;
pub mod executor;
pub mod kv;
pub mod metrics;
pub mod reconciler;
pub mod release;
pub mod router;
pub mod rpc;
pub mod store;
pub mod testing;
pub mod types;

// Re-export the main types for convenience.
pub use config::{
    DistributionConfig, ElectionConfig, ExecutorConfig, ExecutorManagerConfig, NamespaceConfig,
    NamespaceKind, ReconcileConfig, StoreConfig, MIN_HEARTBEAT_INTERVAL,
};
pub use distributor::ShardDistributor;
pub use error::{ElectionError, Error, KvError, NetworkError, Result, StoreError};
pub use types::{
    AssignedState, AssignmentStatus, ExecutorHeartbeatRequest, ExecutorHeartbeatResponse,
    ExecutorId, ExecutorStatus, GetShardOwnerRequest, GetShardOwnerResponse, HeartbeatState,
    NamespaceState, NewEphemeralShardRequest, NewEphemeralShardResponse, ShardAssignment,
    ShardKey, ShardOwner, ShardReport, ShardStatus,
};

// Storage layer.
pub use kv::{KvStore, MemoryKv};
pub use store::{
    nop_guard, AssignShardsRequest, EventType, GuardFunc, KvExecutorStore, NamespaceEvent,
    StateWatch, Store,
};

// Election and reconciliation.
pub use election::{Election, Elector, KvElector};
pub use reconciler::{
    NamespaceReconciler, PlacementInput, PlacementPolicy, ReconcilerSet, SpreadPlacementPolicy,
};

// Caching and routing.
pub use cache::ShardToExecutorCache;
pub use router::{
    Peer, PeerTransport, RouteRequest, ShardRouteChooser, METADATA_GRPC_ADDRESS, NAMESPACE_HEADER,
};

// Executor-side client.
pub use executor::{Executor, ExecutorManager, ShardProcessor, ShardProcessorFactory};

// RPC surface.
pub use rpc::{
    DistributorServer, RpcClient, ShardDistributorApi, ShardDistributorExecutorApi,
};

// Metrics.
pub use metrics::{Counter, DistributorMetrics, Gauge, MetricsSnapshot};
