//! Leader-side reconciliation: turning observed namespace state into
//! committed shard assignments.
//!
//! One [`NamespaceReconciler`] runs per configured namespace. It
//! campaigns for leadership, and while leading it wakes on significant
//! change notifications (debounced) and on a periodic sweep tick; the
//! tick matters because an executor that dies simply stops producing
//! events. Each wakeup reads the state, asks the placement policy for a
//! new assignment, commits it under the election guard, and only then
//! deletes executors whose heartbeat has expired. A crash between the
//! two writes leaves a correct, merely suboptimal state: an executor
//! record without assignments.

mod placement;

pub use placement::{PlacementInput, PlacementPolicy, SpreadPlacementPolicy};

use crate::config::{NamespaceConfig, NamespaceKind, ReconcileConfig};
use crate::election::{Election, Elector};
use crate::error::Result;
use crate::metrics::DistributorMetrics;
use crate::store::{AssignShardsRequest, EventType, NamespaceEvent, StateWatch, Store};
use crate::types::{AssignedState, ExecutorId, NamespaceState, ShardKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reconciliation driver for one namespace.
pub struct NamespaceReconciler {
    namespace: NamespaceConfig,
    store: Arc<dyn Store>,
    elector: Arc<dyn Elector>,
    policy: Arc<dyn PlacementPolicy>,
    config: ReconcileConfig,
    host: String,
    metrics: Arc<DistributorMetrics>,
}

impl NamespaceReconciler {
    pub fn new(
        namespace: NamespaceConfig,
        store: Arc<dyn Store>,
        elector: Arc<dyn Elector>,
        policy: Arc<dyn PlacementPolicy>,
        config: ReconcileConfig,
        host: impl Into<String>,
    ) -> Self {
        Self {
            namespace,
            store,
            elector,
            policy,
            config,
            host: host.into(),
            metrics: Arc::new(DistributorMetrics::new()),
        }
    }

    /// Share a metrics registry with the rest of the process.
    pub fn with_metrics(mut self, metrics: Arc<DistributorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Campaign-and-lead until cancelled. Leadership losses and
    /// persistent failures fall back to a fresh campaign.
    pub async fn run(&self, token: CancellationToken) {
        while !token.is_cancelled() {
            let election = match self.elector.create_election(&self.namespace.name).await {
                Ok(election) => election,
                Err(e) => {
                    warn!(namespace = %self.namespace.name, error = %e, "creating election failed");
                    if Self::pause(&token, Duration::from_secs(1)).await {
                        return;
                    }
                    continue;
                }
            };

            tokio::select! {
                _ = token.cancelled() => {
                    election.cleanup().await;
                    return;
                }
                result = election.campaign(&self.host) => {
                    if let Err(e) = result {
                        warn!(namespace = %self.namespace.name, error = %e, "campaign failed");
                        election.cleanup().await;
                        if Self::pause(&token, Duration::from_secs(1)).await {
                            return;
                        }
                        continue;
                    }
                }
            }

            info!(namespace = %self.namespace.name, host = %self.host, "leading namespace");
            self.metrics.namespaces_led.inc();
            let outcome = self.lead(&election, &token).await;
            self.metrics.namespaces_led.dec();
            if let Err(e) = outcome {
                // Consistent failure: give up leadership so a peer may try.
                error!(namespace = %self.namespace.name, error = %e, "leader loop failed, resigning");
                let _ = election.resign().await;
            }
            election.cleanup().await;
        }
    }

    /// Returns true when cancelled during the pause.
    async fn pause(token: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn lead(&self, election: &Election, token: &CancellationToken) -> Result<()> {
        let mut events = self.store.subscribe(&self.namespace.name).await?;
        let done = election.done();
        let mut sweep = tokio::time::interval(self.config.interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.tick().await; // first tick fires immediately; consume it

        self.reconcile_with_retries(election).await?;

        loop {
            tokio::select! {
                _ = done.cancelled() => {
                    info!(namespace = %self.namespace.name, "leadership lost");
                    return Ok(());
                }
                _ = token.cancelled() => return Ok(()),
                _ = sweep.tick() => {
                    self.reconcile_with_retries(election).await?;
                }
                maybe = events.recv() => {
                    let Some(event) = maybe else { return Ok(()) };
                    if !Self::needs_reconcile(&event) {
                        continue;
                    }
                    debug!(namespace = %self.namespace.name, revision = event.revision, "change notification");
                    if Self::pause(token, self.config.debounce).await {
                        return Ok(());
                    }
                    // Anything that piled up during the debounce is
                    // covered by the read below.
                    while events.try_recv().is_ok() {}
                    self.reconcile_with_retries(election).await?;
                }
            }
        }
    }

    /// The reconciler reacts to fleet changes, not to its own assignment
    /// writes.
    fn needs_reconcile(event: &NamespaceEvent) -> bool {
        event.has_event(EventType::ExecutorStatusChanged)
            || event.has_event(EventType::ExecutorReportShardsChanged)
            || event.has_event(EventType::DeleteExecutors)
    }

    async fn reconcile_with_retries(&self, election: &Election) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.reconcile_once(election).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_version_conflict() => {
                    self.metrics.assignment_conflicts.inc();
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        // Retries exhausted for this wakeup; the next event or
                        // sweep retries with fresh state.
                        warn!(
                            namespace = %self.namespace.name,
                            attempts,
                            "assignment retries exhausted"
                        );
                        return Ok(());
                    }
                    debug!(namespace = %self.namespace.name, attempts, "version conflict, re-reading state");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reconcile_once(&self, election: &Election) -> Result<()> {
        let state = self.store.get_state(&self.namespace.name).await?;

        let now = unix_now();
        let ttl = self.config.executor_ttl.as_secs() as i64;
        let expired: Vec<ExecutorId> = state
            .executors
            .iter()
            .filter(|(_, heartbeat)| now - heartbeat.last_heartbeat > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let mut active: Vec<ExecutorId> = state
            .executors
            .iter()
            .filter(|(id, heartbeat)| heartbeat.status.is_assignable() && !expired.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();

        let shards = self.shard_universe(&state);
        let input = PlacementInput {
            state: &state,
            active_executors: active,
            shards,
        };
        let desired = self.policy.compute(&input);

        // Write only what changed; rewriting identical assignments would
        // bump revisions and ripple through every subscriber.
        let changed: HashMap<ExecutorId, AssignedState> = desired
            .into_iter()
            .filter(|(executor, state_new)| {
                state
                    .shard_assignments
                    .get(executor)
                    .map(|current| current.assigned_shards != state_new.assigned_shards)
                    .unwrap_or(true)
            })
            .collect();

        if changed.is_empty() && expired.is_empty() {
            return Ok(());
        }

        if !changed.is_empty() {
            info!(
                namespace = %self.namespace.name,
                executors = changed.len(),
                "committing new shard assignments"
            );
            self.store
                .assign_shards(
                    &self.namespace.name,
                    AssignShardsRequest {
                        new_state: NamespaceState {
                            shard_assignments: changed,
                            executors: state.executors.clone(),
                            global_revision: state.global_revision,
                        },
                    },
                    election.guard(),
                )
                .await?;
            self.metrics.assignments_committed.inc();
        }

        if !expired.is_empty() {
            // Assignments first, deletions second: a crash in between
            // leaves an executor record with empty assignments, which the
            // next pass cleans up.
            info!(namespace = %self.namespace.name, executors = ?expired, "expiring executors");
            self.store
                .delete_executors(&self.namespace.name, &expired, election.guard())
                .await?;
            self.metrics.executors_expired.inc_by(expired.len() as u64);
        }

        Ok(())
    }

    /// The shard universe: configured fixed shards plus everything known
    /// from reports and prior assignments.
    fn shard_universe(&self, state: &NamespaceState) -> Vec<ShardKey> {
        let mut shards = BTreeSet::new();
        if let NamespaceKind::Fixed { shard_count } = self.namespace.kind {
            for shard in 0..shard_count {
                shards.insert(shard.to_string());
            }
        }
        for heartbeat in state.executors.values() {
            shards.extend(heartbeat.reported_shards.keys().cloned());
        }
        for assigned in state.shard_assignments.values() {
            shards.extend(assigned.assigned_shards.keys().cloned());
        }
        shards.into_iter().collect()
    }
}

/// Runs one reconciler task per configured namespace.
pub struct ReconcilerSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ReconcilerSet {
    /// Spawn reconcilers for every namespace in the config, sharing one
    /// metrics registry.
    pub fn spawn(
        namespaces: Vec<NamespaceConfig>,
        store: Arc<dyn Store>,
        elector: Arc<dyn Elector>,
        policy: Arc<dyn PlacementPolicy>,
        config: ReconcileConfig,
        host: impl Into<String>,
        metrics: Arc<DistributorMetrics>,
    ) -> Self {
        let token = CancellationToken::new();
        let host = host.into();
        let handles = namespaces
            .into_iter()
            .map(|namespace| {
                let reconciler = NamespaceReconciler::new(
                    namespace,
                    store.clone(),
                    elector.clone(),
                    policy.clone(),
                    config.clone(),
                    host.clone(),
                )
                .with_metrics(metrics.clone());
                let child = token.child_token();
                tokio::spawn(async move { reconciler.run(child).await })
            })
            .collect();
        Self { token, handles }
    }

    /// Stop every reconciler and wait for the tasks to finish.
    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
