//! Backend abstraction: a transactional key-value store with revisions,
//! prefix watches, and leases.
//!
//! This is the seam between the shard distribution service and whatever
//! durable store backs it. The contract is deliberately narrow: the store,
//! elector, and cache are written against [`KvStore`] and nothing else.
//! [`memory::MemoryKv`] is the in-process implementation used by tests and
//! embedded deployments; a remote backend plugs in behind the same trait.
//!
//! Semantics:
//! - Every committed mutating transaction increments a single global
//!   revision; each touched key records it as its `mod_revision`.
//! - Compares read a missing key as revision 0, which makes
//!   `ModRevision == 0` the create-if-absent predicate.
//! - Transactions nest: an outer guard condition can wrap an inner
//!   transaction with its own compares.
//! - Keys written under a lease are deleted (with watch events) when the
//!   lease expires or is revoked.

pub mod memory;

pub use memory::MemoryKv;

use crate::error::KvError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lease identifier.
pub type LeaseId = i64;

/// A stored key-value pair with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which the key was created.
    pub create_revision: i64,
    /// Revision of the last write to the key.
    pub mod_revision: i64,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

/// What a transactional compare tests against.
#[derive(Debug, Clone, PartialEq)]
pub enum CompareTarget {
    /// The key's `mod_revision` equals the given revision. A missing key
    /// reads as revision 0.
    ModRevision(i64),
    /// The key's value equals the given string. A missing key never
    /// matches.
    Value(String),
}

/// A single transactional precondition.
#[derive(Debug, Clone, PartialEq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
}

impl Compare {
    /// Require `mod_revision(key) == revision`.
    pub fn mod_revision(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::ModRevision(revision),
        }
    }

    /// Require `value(key) == value`.
    pub fn value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Value(value.into()),
        }
    }
}

/// A transactional operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// Write a key, optionally attached to a lease.
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    /// Delete a single key.
    Delete { key: String },
    /// Delete every key under a prefix.
    DeletePrefix { prefix: String },
    /// A nested transaction with its own compares.
    Txn(Txn),
}

impl Op {
    /// Write a key.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    /// Write a key attached to a lease.
    pub fn put_with_lease(
        key: impl Into<String>,
        value: impl Into<String>,
        lease: LeaseId,
    ) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    /// Delete a key.
    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }

    /// Delete every key under a prefix.
    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Op::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// A compare-and-act transaction.
///
/// If every compare in `compares` holds, the `success` ops execute;
/// otherwise the `failure` ops execute. Either way the commit is atomic.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    /// An unconditional transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition.
    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    /// Add an operation to run when the preconditions hold.
    pub fn and_then(mut self, op: Op) -> Self {
        self.success.push(op);
        self
    }

    /// Add an operation to run when a precondition fails.
    pub fn or_else(mut self, op: Op) -> Self {
        self.failure.push(op);
        self
    }
}

/// Result of one executed transactional operation.
#[derive(Debug, Clone)]
pub enum OpResponse {
    Put { mod_revision: i64 },
    Delete { deleted: usize },
    Txn(TxnResponse),
}

/// Result of a committed transaction.
#[derive(Debug, Clone)]
pub struct TxnResponse {
    /// Whether the compares held and the success branch executed.
    pub succeeded: bool,
    /// Global revision after the commit.
    pub revision: i64,
    /// Per-op results of the executed branch.
    pub responses: Vec<OpResponse>,
}

impl TxnResponse {
    /// The first nested transaction response in the executed branch, if
    /// any. Guarded writes put their real work in a nested transaction and
    /// read its outcome here.
    pub fn nested(&self) -> Option<&TxnResponse> {
        self.responses.iter().find_map(|r| match r {
            OpResponse::Txn(nested) => Some(nested),
            _ => None,
        })
    }
}

/// Result of a prefix range read.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// Global revision the snapshot was read at.
    pub revision: i64,
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One key change observed by a watcher.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub mod_revision: i64,
}

/// All changes from one committed transaction that touched the watched
/// prefix.
#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    pub revision: i64,
}

/// A granted lease. `expired` fires when the lease ends, whether by TTL
/// expiry or explicit revocation.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub expired: CancellationToken,
}

/// The backend contract. All operations are linearizable per the backend.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError>;

    /// Snapshot-read every key under a prefix.
    async fn range(&self, prefix: &str) -> Result<RangeResponse, KvError>;

    /// Atomically commit a transaction.
    async fn commit(&self, txn: Txn) -> Result<TxnResponse, KvError>;

    /// Watch a prefix. The stream delivers one batch per committed
    /// transaction that touched the prefix, starting after the current
    /// revision.
    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<WatchBatch>, KvError>;

    /// Grant a lease with the given TTL.
    async fn lease_grant(&self, ttl: Duration) -> Result<Lease, KvError>;

    /// Reset a lease's expiry clock.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError>;
}
