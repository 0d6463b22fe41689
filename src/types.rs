//! Core types shared across the shard distribution service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Executor identifier. Opaque to the service; typically a UUID.
pub type ExecutorId = String;

/// Application-defined shard key whose owner the service tracks.
pub type ShardKey = String;

/// Lifecycle status of an executor.
///
/// Serialized as a stable string tag everywhere (store and wire).
/// Renaming a tag is a two-phase migration; readers must keep decoding
/// the old tag meanwhile. Unknown tags decode to `Invalid`, never an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum ExecutorStatus {
    /// Decoded a record but found no usable status. Never eligible for
    /// assignment.
    #[default]
    Invalid,

    /// Accepting shard assignments.
    Active,

    /// Shutting down; existing shards are being moved off.
    Draining,

    /// Fully drained; safe to delete.
    Drained,
}

impl From<String> for ExecutorStatus {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ACTIVE" => ExecutorStatus::Active,
            "DRAINING" => ExecutorStatus::Draining,
            "DRAINED" => ExecutorStatus::Drained,
            _ => ExecutorStatus::Invalid,
        }
    }
}

impl From<ExecutorStatus> for String {
    fn from(status: ExecutorStatus) -> String {
        status.to_string()
    }
}

impl ExecutorStatus {
    /// True when the executor may receive new shard assignments.
    pub fn is_assignable(&self) -> bool {
        matches!(self, ExecutorStatus::Active)
    }
}

impl std::fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorStatus::Invalid => write!(f, "INVALID"),
            ExecutorStatus::Active => write!(f, "ACTIVE"),
            ExecutorStatus::Draining => write!(f, "DRAINING"),
            ExecutorStatus::Drained => write!(f, "DRAINED"),
        }
    }
}

/// Status of a shard as reported by the executor running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum ShardStatus {
    #[default]
    Invalid,

    Ready,
}

impl From<String> for ShardStatus {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "READY" => ShardStatus::Ready,
            _ => ShardStatus::Invalid,
        }
    }
}

impl From<ShardStatus> for String {
    fn from(status: ShardStatus) -> String {
        match status {
            ShardStatus::Invalid => "INVALID".to_string(),
            ShardStatus::Ready => "READY".to_string(),
        }
    }
}

/// Status of a shard assignment as authored by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum AssignmentStatus {
    #[default]
    Invalid,

    Ready,
}

impl From<String> for AssignmentStatus {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "READY" => AssignmentStatus::Ready,
            _ => AssignmentStatus::Invalid,
        }
    }
}

impl From<AssignmentStatus> for String {
    fn from(status: AssignmentStatus) -> String {
        match status {
            AssignmentStatus::Invalid => "INVALID".to_string(),
            AssignmentStatus::Ready => "READY".to_string(),
        }
    }
}

/// Executor-authored report for one shard it is currently running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShardReport {
    /// Reported status of the shard.
    pub status: ShardStatus,

    /// Load indicator, interpreted by the placement policy.
    pub load: f64,
}

impl ShardReport {
    /// Create a READY report with the given load.
    pub fn ready(load: f64) -> Self {
        Self {
            status: ShardStatus::Ready,
            load,
        }
    }
}

/// Leader-authored assignment entry for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShardAssignment {
    /// Assignment status. Only `READY` entries are acted on by executors.
    pub status: AssignmentStatus,
}

impl ShardAssignment {
    /// Create a READY assignment.
    pub fn ready() -> Self {
        Self {
            status: AssignmentStatus::Ready,
        }
    }
}

/// The executor-authored projection of one executor's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HeartbeatState {
    /// Unix seconds of the last heartbeat, stamped by the receiving
    /// handler.
    pub last_heartbeat: i64,

    /// Executor lifecycle status.
    pub status: ExecutorStatus,

    /// Shards the executor says it is actually running, with load.
    #[serde(default)]
    pub reported_shards: HashMap<ShardKey, ShardReport>,

    /// Executor-advertised metadata, notably its network address.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The leader-authored per-executor view of "what you should be running".
///
/// `mod_revision` is backend metadata captured at read time and used as
/// the optimistic-concurrency token for writes; it is never part of the
/// stored JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssignedState {
    /// Shards assigned to this executor.
    #[serde(default)]
    pub assigned_shards: HashMap<ShardKey, ShardAssignment>,

    /// Backend revision of the stored `assigned_state` key at last read.
    /// Zero means the key does not exist yet.
    #[serde(skip)]
    pub mod_revision: i64,
}

impl AssignedState {
    /// An empty assignment carrying the given revision token.
    pub fn empty_at(mod_revision: i64) -> Self {
        Self {
            assigned_shards: HashMap::new(),
            mod_revision,
        }
    }
}

/// Snapshot of one namespace: every executor's heartbeat projection and
/// assignment, stamped with the backend's global revision at read time.
#[derive(Debug, Clone, Default)]
pub struct NamespaceState {
    /// Executor-authored state per executor.
    pub executors: HashMap<ExecutorId, HeartbeatState>,

    /// Leader-authored assignments per executor.
    pub shard_assignments: HashMap<ExecutorId, AssignedState>,

    /// Backend global revision the snapshot was read at.
    pub global_revision: i64,
}

impl NamespaceState {
    /// Find the current owner of a shard, if any.
    pub fn owner_of(&self, shard: &str) -> Option<&ExecutorId> {
        self.shard_assignments
            .iter()
            .find(|(_, state)| state.assigned_shards.contains_key(shard))
            .map(|(executor, _)| executor)
    }
}

/// Resolved owner of a shard: the executor plus its advertised metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOwner {
    /// Owning executor.
    pub executor_id: ExecutorId,

    /// The owner's advertised metadata (contains its network address).
    pub metadata: HashMap<String, String>,
}

/// Request for `ShardDistributorApi::get_shard_owner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetShardOwnerRequest {
    pub namespace: String,
    pub shard_key: ShardKey,
}

/// Response for `ShardDistributorApi::get_shard_owner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetShardOwnerResponse {
    pub namespace: String,
    pub owner: ExecutorId,
}

/// Request for `ShardDistributorApi::new_ephemeral_shard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEphemeralShardRequest {
    pub namespace: String,
    pub shard_key: ShardKey,
}

/// Response for `ShardDistributorApi::new_ephemeral_shard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEphemeralShardResponse {
    pub namespace: String,
    pub owner: ExecutorId,
}

/// Request for `ShardDistributorExecutorApi::heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorHeartbeatRequest {
    pub namespace: String,
    pub executor_id: ExecutorId,
    pub status: ExecutorStatus,
    #[serde(default)]
    pub shard_status_reports: HashMap<ShardKey, ShardReport>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response for `ShardDistributorExecutorApi::heartbeat`.
///
/// Always carries the full desired assignment, even when empty, so
/// executors recover correct ownership at most one tick after any
/// inconsistency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorHeartbeatResponse {
    #[serde(default)]
    pub shard_assignments: HashMap<ShardKey, ShardAssignment>,
}
