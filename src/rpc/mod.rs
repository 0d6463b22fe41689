//! RPC surface of the distributor.
//!
//! Two services share one wire protocol (4-byte big-endian length prefix
//! + bincode body over TCP):
//! - [`ShardDistributorApi`]: ownership lookups and on-demand ephemeral
//!   shards, used by routing clients.
//! - [`ShardDistributorExecutorApi`]: heartbeats, used by executors.
//!
//! [`crate::distributor::ShardDistributor`] implements both locally;
//! [`RpcClient`] implements both over the network, so callers are
//! indifferent to where the distributor runs.

mod client;
mod server;
mod wire;

pub use client::RpcClient;
pub use server::DistributorServer;
pub use wire::{ErrorCode, ErrorResponse, Request, Response, MAX_MESSAGE_SIZE};

use crate::error::Result;
use crate::types::{
    ExecutorHeartbeatRequest, ExecutorHeartbeatResponse, GetShardOwnerRequest,
    GetShardOwnerResponse, NewEphemeralShardRequest, NewEphemeralShardResponse,
};
use async_trait::async_trait;

/// Ownership lookups and on-demand shard creation.
#[async_trait]
pub trait ShardDistributorApi: Send + Sync + 'static {
    /// Resolve the executor owning a shard.
    async fn get_shard_owner(&self, request: GetShardOwnerRequest) -> Result<GetShardOwnerResponse>;

    /// Assign an unassigned shard on demand and return its owner.
    async fn new_ephemeral_shard(
        &self,
        request: NewEphemeralShardRequest,
    ) -> Result<NewEphemeralShardResponse>;
}

/// Executor-facing heartbeat service.
#[async_trait]
pub trait ShardDistributorExecutorApi: Send + Sync + 'static {
    /// Record a heartbeat and return the executor's full desired
    /// assignment.
    async fn heartbeat(
        &self,
        request: ExecutorHeartbeatRequest,
    ) -> Result<ExecutorHeartbeatResponse>;
}

/// Everything a distributor endpoint serves.
pub trait DistributorService: ShardDistributorApi + ShardDistributorExecutorApi {}

impl<T: ShardDistributorApi + ShardDistributorExecutorApi> DistributorService for T {}
