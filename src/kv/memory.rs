//! In-memory key-value backend.
//!
//! Cloneable; clones share the same underlying data, so every component
//! holding a handle observes the same revisions and watch stream.

use super::{
    Compare, CompareTarget, KeyValue, KvStore, Lease, LeaseId, Op, OpResponse, RangeResponse, Txn,
    TxnResponse, WatchBatch, WatchEvent, WatchEventKind,
};
use crate::error::KvError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the sweeper checks for expired leases.
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone)]
struct StoredValue {
    value: String,
    create_revision: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    expired: CancellationToken,
}

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<WatchBatch>,
}

#[derive(Default)]
struct MemoryKvCore {
    data: BTreeMap<String, StoredValue>,
    revision: i64,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
}

/// In-memory [`KvStore`] implementation.
///
/// Must be created inside a Tokio runtime: lease expiry is driven by a
/// background sweeper task, which stops when the last handle is dropped.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryKvCore>>,
    sweeper: CancellationToken,
}

impl MemoryKv {
    /// Create a new in-memory backend and start its lease sweeper.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(MemoryKvCore {
            next_lease: 1,
            ..Default::default()
        }));
        let sweeper = CancellationToken::new();

        let sweep_inner = Arc::downgrade(&inner);
        let sweep_token = sweeper.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let Some(inner) = sweep_inner.upgrade() else {
                    return;
                };
                Self::expire_leases(&inner);
            }
        });

        Self { inner, sweeper }
    }

    /// The current global revision.
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    fn expire_leases(inner: &Arc<Mutex<MemoryKvCore>>) {
        let now = Instant::now();
        let mut core = inner.lock();
        let expired: Vec<LeaseId> = core
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "lease expired");
            Self::end_lease(&mut core, id);
        }
    }

    /// Remove a lease and delete every key attached to it. Caller holds
    /// the lock.
    fn end_lease(core: &mut MemoryKvCore, id: LeaseId) {
        let Some(record) = core.leases.remove(&id) else {
            return;
        };
        record.expired.cancel();

        let keys: Vec<String> = core
            .data
            .iter()
            .filter(|(_, v)| v.lease == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        if keys.is_empty() {
            return;
        }

        core.revision += 1;
        let revision = core.revision;
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            core.data.remove(&key);
            events.push(WatchEvent {
                kind: WatchEventKind::Delete,
                key,
                mod_revision: revision,
            });
        }
        Self::notify(core, events, revision);
    }

    /// Fan a batch of events out to matching watchers. Caller holds the
    /// lock.
    fn notify(core: &mut MemoryKvCore, events: Vec<WatchEvent>, revision: i64) {
        core.watchers.retain(|watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.sender.is_closed();
            }
            watcher
                .sender
                .send(WatchBatch {
                    events: matching,
                    revision,
                })
                .is_ok()
        });
    }

    fn check(core: &MemoryKvCore, compare: &Compare) -> bool {
        let stored = core.data.get(&compare.key);
        match &compare.target {
            CompareTarget::ModRevision(rev) => stored.map(|v| v.mod_revision).unwrap_or(0) == *rev,
            CompareTarget::Value(value) => stored.map(|v| v.value == *value).unwrap_or(false),
        }
    }

    /// Decide which branch of a transaction tree executes without applying
    /// anything. Compares are all evaluated against the pre-commit state.
    fn plan(core: &MemoryKvCore, txn: &Txn) -> PlannedTxn {
        let succeeded = txn.compares.iter().all(|c| Self::check(core, c));
        let branch = if succeeded { &txn.success } else { &txn.failure };
        let ops = branch
            .iter()
            .map(|op| match op {
                Op::Txn(nested) => PlannedOp::Txn(Self::plan(core, nested)),
                other => PlannedOp::Flat(other.clone()),
            })
            .collect();
        PlannedTxn { succeeded, ops }
    }

    fn plan_mutates(plan: &PlannedTxn) -> bool {
        plan.ops.iter().any(|op| match op {
            PlannedOp::Flat(_) => true,
            PlannedOp::Txn(nested) => Self::plan_mutates(nested),
        })
    }

    /// Apply a planned transaction tree at the given revision, collecting
    /// watch events. Caller holds the lock.
    fn apply(
        core: &mut MemoryKvCore,
        plan: PlannedTxn,
        revision: i64,
        events: &mut Vec<WatchEvent>,
    ) -> TxnResponse {
        let mut responses = Vec::with_capacity(plan.ops.len());
        for op in plan.ops {
            match op {
                PlannedOp::Flat(Op::Put { key, value, lease }) => {
                    let create_revision = core
                        .data
                        .get(&key)
                        .map(|v| v.create_revision)
                        .unwrap_or(revision);
                    core.data.insert(
                        key.clone(),
                        StoredValue {
                            value,
                            create_revision,
                            mod_revision: revision,
                            lease,
                        },
                    );
                    events.push(WatchEvent {
                        kind: WatchEventKind::Put,
                        key,
                        mod_revision: revision,
                    });
                    responses.push(OpResponse::Put {
                        mod_revision: revision,
                    });
                }
                PlannedOp::Flat(Op::Delete { key }) => {
                    let deleted = core.data.remove(&key).is_some();
                    if deleted {
                        events.push(WatchEvent {
                            kind: WatchEventKind::Delete,
                            key,
                            mod_revision: revision,
                        });
                    }
                    responses.push(OpResponse::Delete {
                        deleted: usize::from(deleted),
                    });
                }
                PlannedOp::Flat(Op::DeletePrefix { prefix }) => {
                    let keys: Vec<String> = core
                        .data
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in &keys {
                        core.data.remove(key);
                        events.push(WatchEvent {
                            kind: WatchEventKind::Delete,
                            key: key.clone(),
                            mod_revision: revision,
                        });
                    }
                    responses.push(OpResponse::Delete {
                        deleted: keys.len(),
                    });
                }
                PlannedOp::Flat(Op::Txn(_)) => unreachable!("nested txns are planned"),
                PlannedOp::Txn(nested) => {
                    let nested_resp = Self::apply(core, nested, revision, events);
                    responses.push(OpResponse::Txn(nested_resp));
                }
            }
        }
        TxnResponse {
            succeeded: plan.succeeded,
            revision,
            responses,
        }
    }
}

struct PlannedTxn {
    succeeded: bool,
    ops: Vec<PlannedOp>,
}

enum PlannedOp {
    Flat(Op),
    Txn(PlannedTxn),
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryKv {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.sweeper.cancel();
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        let core = self.inner.lock();
        Ok(core.data.get(key).map(|v| KeyValue {
            key: key.to_string(),
            value: v.value.clone(),
            create_revision: v.create_revision,
            mod_revision: v.mod_revision,
            lease: v.lease,
        }))
    }

    async fn range(&self, prefix: &str) -> Result<RangeResponse, KvError> {
        let core = self.inner.lock();
        let kvs = core
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
                create_revision: v.create_revision,
                mod_revision: v.mod_revision,
                lease: v.lease,
            })
            .collect();
        Ok(RangeResponse {
            kvs,
            revision: core.revision,
        })
    }

    async fn commit(&self, txn: Txn) -> Result<TxnResponse, KvError> {
        let mut core = self.inner.lock();
        let plan = Self::plan(&core, &txn);

        if !Self::plan_mutates(&plan) {
            let revision = core.revision;
            let succeeded = plan.succeeded;
            let mut events = Vec::new();
            let response = Self::apply(&mut core, plan, revision, &mut events);
            debug_assert!(events.is_empty());
            return Ok(TxnResponse {
                succeeded,
                revision,
                responses: response.responses,
            });
        }

        core.revision += 1;
        let revision = core.revision;
        let mut events = Vec::new();
        let response = Self::apply(&mut core, plan, revision, &mut events);
        if !events.is_empty() {
            Self::notify(&mut core, events, revision);
        }
        Ok(response)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<WatchBatch>, KvError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender: tx,
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<Lease, KvError> {
        let mut core = self.inner.lock();
        let id = core.next_lease;
        core.next_lease += 1;
        let expired = CancellationToken::new();
        core.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                expired: expired.clone(),
            },
        );
        Ok(Lease { id, expired })
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut core = self.inner.lock();
        let record = core
            .leases
            .get_mut(&lease)
            .ok_or(KvError::LeaseNotFound(lease))?;
        record.deadline = Instant::now() + record.ttl;
        Ok(())
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut core = self.inner.lock();
        if !core.leases.contains_key(&lease) {
            return Err(KvError::LeaseNotFound(lease));
        }
        MemoryKv::end_lease(&mut core, lease);
        Ok(())
    }
}
