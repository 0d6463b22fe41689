//! Executor-side control loop.
//!
//! Every worker process runs one [`Executor`] per namespace it
//! participates in. The loop heartbeats on a ticker, reporting the load
//! of every locally running [`ShardProcessor`], and reconciles the local
//! processor set to whatever assignment the server answers with: newly
//! READY shards get a processor, shards missing from the response are
//! stopped. Heartbeat failures are logged and retried on the next tick;
//! they are never a reason to drop local shards, since the server either
//! re-sends the assignment or lets the executor drain naturally.

use crate::config::{ExecutorConfig, ExecutorManagerConfig};
use crate::error::{Error, Result};
use crate::rpc::ShardDistributorExecutorApi;
use crate::types::{
    ExecutorHeartbeatRequest, ExecutorId, ExecutorStatus, AssignmentStatus, ShardAssignment,
    ShardKey, ShardReport,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Capability set of a locally running shard.
///
/// Both fixed and ephemeral processor families implement this one trait;
/// the difference between them lives entirely in the factory.
#[async_trait::async_trait]
pub trait ShardProcessor: Send + Sync + 'static {
    /// Start processing. The token governs the processor's lifetime: it
    /// is cancelled when the executor shuts down.
    async fn start(&self, shutdown: CancellationToken);

    /// Stop processing and release resources.
    async fn stop(&self);

    /// Report current status and load for the next heartbeat.
    fn get_shard_report(&self) -> ShardReport;
}

/// Creates a processor for a newly assigned shard.
pub trait ShardProcessorFactory: Send + Sync + 'static {
    type Processor: ShardProcessor;

    fn new_shard_processor(&self, shard_key: &ShardKey) -> Result<Self::Processor>;
}

/// Per-namespace heartbeat and reconcile loop.
pub struct Executor<F: ShardProcessorFactory> {
    client: Arc<dyn ShardDistributorExecutorApi>,
    factory: Arc<F>,
    namespace: String,
    executor_id: ExecutorId,
    heartbeat_interval: Duration,
    metadata: HashMap<String, String>,
    status: RwLock<ExecutorStatus>,
    processors: DashMap<ShardKey, Arc<F::Processor>>,
    shutdown: CancellationToken,
}

impl<F: ShardProcessorFactory> Executor<F> {
    /// Create an executor from its config. A missing executor id is
    /// generated.
    pub fn new(
        config: ExecutorConfig,
        client: Arc<dyn ShardDistributorExecutorApi>,
        factory: Arc<F>,
    ) -> Self {
        let executor_id = config
            .executor_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            client,
            factory,
            namespace: config.namespace,
            executor_id,
            heartbeat_interval: config.heartbeat_interval,
            metadata: config.metadata,
            status: RwLock::new(ExecutorStatus::Active),
            processors: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// This executor's identity.
    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    /// The namespace this executor participates in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Report a new lifecycle status with the next heartbeat. Used to
    /// drain: set `Draining`, wait for assignments to move away, then
    /// `Drained`.
    pub fn set_status(&self, status: ExecutorStatus) {
        *self.status.write() = status;
        info!(
            namespace = %self.namespace,
            executor = %self.executor_id,
            status = %status,
            "executor status changed"
        );
    }

    /// Start the heartbeat loop.
    pub fn start(self: &Arc<Self>) {
        let executor = self.clone();
        tokio::spawn(async move { executor.heartbeat_loop().await });
    }

    /// Stop the loop; every owned processor is stopped before the loop
    /// task exits.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// The processor currently running a shard, if this executor owns it.
    pub fn get_shard_processor(&self, shard_key: &str) -> Result<Arc<F::Processor>> {
        self.processors
            .get(shard_key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::Unavailable(format!(
                    "shard processor not found for shard {shard_key}"
                ))
            })
    }

    /// Number of locally running processors.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        info!(
            namespace = %self.namespace,
            executor = %self.executor_id,
            "executor heartbeat loop started"
        );
        let mut tick = tokio::time::interval(self.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop_all_processors().await;
                    info!(
                        namespace = %self.namespace,
                        executor = %self.executor_id,
                        "executor stopped"
                    );
                    return;
                }
                _ = tick.tick() => {
                    match self.heartbeat().await {
                        Ok(assignments) => self.apply_assignment(assignments).await,
                        Err(e) => {
                            // Keep running local shards; the server will
                            // re-send the assignment on the next tick.
                            warn!(
                                namespace = %self.namespace,
                                executor = %self.executor_id,
                                error = %e,
                                "heartbeat failed"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn heartbeat(&self) -> Result<HashMap<ShardKey, ShardAssignment>> {
        let shard_status_reports = self
            .processors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_shard_report()))
            .collect();
        let status = *self.status.read();

        let response = self
            .client
            .heartbeat(ExecutorHeartbeatRequest {
                namespace: self.namespace.clone(),
                executor_id: self.executor_id.clone(),
                status,
                shard_status_reports,
                metadata: self.metadata.clone(),
            })
            .await?;
        Ok(response.shard_assignments)
    }

    async fn apply_assignment(&self, assignments: HashMap<ShardKey, ShardAssignment>) {
        // Stop shards that are no longer ours (missing or not READY).
        let stopped: Vec<(ShardKey, Arc<F::Processor>)> = self
            .processors
            .iter()
            .filter(|entry| {
                !matches!(
                    assignments.get(entry.key()),
                    Some(assignment) if assignment.status == AssignmentStatus::Ready
                )
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (shard_key, processor) in stopped {
            processor.stop().await;
            self.processors.remove(&shard_key);
            info!(
                namespace = %self.namespace,
                shard = %shard_key,
                "stopped shard processor"
            );
        }

        // Start newly assigned shards. Creation errors are retried on the
        // next tick: the assignment will still be in the response.
        for (shard_key, assignment) in assignments {
            if assignment.status != AssignmentStatus::Ready
                || self.processors.contains_key(&shard_key)
            {
                continue;
            }
            match self.factory.new_shard_processor(&shard_key) {
                Ok(processor) => {
                    let processor = Arc::new(processor);
                    processor.start(self.shutdown.child_token()).await;
                    self.processors.insert(shard_key.clone(), processor);
                    info!(
                        namespace = %self.namespace,
                        shard = %shard_key,
                        "started shard processor"
                    );
                }
                Err(e) => {
                    error!(
                        namespace = %self.namespace,
                        shard = %shard_key,
                        error = %e,
                        "failed to create shard processor"
                    );
                }
            }
        }
    }

    async fn stop_all_processors(&self) {
        let all: Vec<(ShardKey, Arc<F::Processor>)> = self
            .processors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (shard_key, processor) in all {
            processor.stop().await;
            self.processors.remove(&shard_key);
        }
    }
}

/// One executor per configured namespace.
pub struct ExecutorManager<F: ShardProcessorFactory> {
    executors: HashMap<String, Arc<Executor<F>>>,
}

impl<F: ShardProcessorFactory> ExecutorManager<F> {
    /// Build executors for every configured namespace. Fails on invalid
    /// configuration (empty or duplicate namespaces, heartbeat interval
    /// below the minimum).
    pub fn new(
        config: ExecutorManagerConfig,
        client: Arc<dyn ShardDistributorExecutorApi>,
        factory: Arc<F>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let mut executors = HashMap::new();
        for executor_config in config.executors {
            let namespace = executor_config.namespace.clone();
            let executor = Arc::new(Executor::new(
                executor_config,
                client.clone(),
                factory.clone(),
            ));
            info!(
                namespace = %namespace,
                executor = %executor.executor_id(),
                "created executor"
            );
            executors.insert(namespace, executor);
        }
        Ok(Self { executors })
    }

    /// Start every executor loop.
    pub fn start(&self) {
        for executor in self.executors.values() {
            executor.start();
        }
    }

    /// Stop every executor loop.
    pub fn stop(&self) {
        for executor in self.executors.values() {
            executor.stop();
        }
    }

    /// The processor running a shard in a namespace.
    pub fn get_shard_processor(&self, namespace: &str, shard_key: &str) -> Result<Arc<F::Processor>> {
        self.get_executor_for_namespace(namespace)?
            .get_shard_processor(shard_key)
    }

    /// The executor serving a namespace.
    pub fn get_executor_for_namespace(&self, namespace: &str) -> Result<&Arc<Executor<F>>> {
        self.executors.get(namespace).ok_or_else(|| {
            Error::NamespaceNotFound {
                namespace: namespace.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::ExecutorHeartbeatResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// Scripted heartbeat endpoint: pops one response per call, repeats
    /// the last one when the script runs dry.
    struct ScriptedClient {
        script: Mutex<Vec<Result<ExecutorHeartbeatResponse>>>,
        last: Mutex<HashMap<ShardKey, ShardAssignment>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<ExecutorHeartbeatResponse>>) -> Arc<Self> {
            let mut script = script;
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                last: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ShardDistributorExecutorApi for ScriptedClient {
        async fn heartbeat(
            &self,
            _request: ExecutorHeartbeatRequest,
        ) -> Result<ExecutorHeartbeatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop() {
                Some(Ok(response)) => {
                    *self.last.lock() = response.shard_assignments.clone();
                    Ok(response)
                }
                Some(Err(e)) => Err(e),
                None => Ok(ExecutorHeartbeatResponse {
                    shard_assignments: self.last.lock().clone(),
                }),
            }
        }
    }

    struct TestProcessor {
        shard_key: ShardKey,
        running: AtomicBool,
    }

    #[async_trait]
    impl ShardProcessor for TestProcessor {
        async fn start(&self, _shutdown: CancellationToken) {
            self.running.store(true, Ordering::SeqCst);
        }

        async fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn get_shard_report(&self) -> ShardReport {
            ShardReport::ready(self.shard_key.len() as f64)
        }
    }

    struct TestFactory {
        created: AtomicUsize,
        fail: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    impl ShardProcessorFactory for TestFactory {
        type Processor = TestProcessor;

        fn new_shard_processor(&self, shard_key: &ShardKey) -> Result<TestProcessor> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Internal("factory failure".to_string()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TestProcessor {
                shard_key: shard_key.clone(),
                running: AtomicBool::new(false),
            })
        }
    }

    fn assignments(shards: &[&str]) -> ExecutorHeartbeatResponse {
        ExecutorHeartbeatResponse {
            shard_assignments: shards
                .iter()
                .map(|s| (s.to_string(), ShardAssignment::ready()))
                .collect(),
        }
    }

    fn test_config() -> ExecutorConfig {
        // The config-level minimum does not bind direct construction;
        // short intervals keep the tests fast.
        ExecutorConfig {
            executor_id: Some("e1".to_string()),
            namespace: "ns".to_string(),
            heartbeat_interval: Duration::from_millis(30),
            metadata: HashMap::new(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn test_executor_starts_and_stops_processors_per_assignment() {
        let client = ScriptedClient::new(vec![
            Ok(assignments(&["s1", "s2"])),
            Ok(assignments(&["s1", "s2"])),
            Ok(assignments(&["s2"])),
        ]);
        let factory = TestFactory::new();
        let executor = Arc::new(Executor::new(test_config(), client.clone(), factory.clone()));

        executor.start();

        // Both shards come up, then s1 is withdrawn.
        wait_for("s2 to remain the only processor", || {
            client.calls.load(Ordering::SeqCst) >= 3 && executor.processor_count() == 1
        })
        .await;
        assert!(executor.get_shard_processor("s2").is_ok());
        assert!(executor.get_shard_processor("s1").is_err());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        executor.stop();
        wait_for("all processors stopped", || executor.processor_count() == 0).await;
    }

    #[tokio::test]
    async fn test_heartbeat_error_keeps_local_shards() {
        let client = ScriptedClient::new(vec![
            Ok(assignments(&["s1"])),
            Err(Error::Unavailable("server down".to_string())),
            Err(Error::Unavailable("server down".to_string())),
        ]);
        let factory = TestFactory::new();
        let executor = Arc::new(Executor::new(test_config(), client.clone(), factory.clone()));

        executor.start();
        wait_for("s1 processor to start", || executor.processor_count() == 1).await;

        // Ride through the failed heartbeats; the shard must survive.
        wait_for("failed heartbeats to pass", || {
            client.calls.load(Ordering::SeqCst) >= 4
        })
        .await;
        assert_eq!(executor.processor_count(), 1);
        assert!(executor.get_shard_processor("s1").is_ok());

        executor.stop();
    }

    #[tokio::test]
    async fn test_factory_failure_is_retried_next_tick() {
        let client = ScriptedClient::new(vec![Ok(assignments(&["s1"]))]);
        let factory = TestFactory::new();
        factory.fail.store(true, Ordering::SeqCst);
        let executor = Arc::new(Executor::new(test_config(), client.clone(), factory.clone()));

        executor.start();
        wait_for("a few failing ticks", || {
            client.calls.load(Ordering::SeqCst) >= 2
        })
        .await;
        assert_eq!(executor.processor_count(), 0);

        // Once the factory recovers, the shard comes up on the next tick.
        factory.fail.store(false, Ordering::SeqCst);
        wait_for("s1 processor to start", || executor.processor_count() == 1).await;

        executor.stop();
    }

    #[tokio::test]
    async fn test_manager_validates_config() {
        let client = ScriptedClient::new(vec![]);
        let factory = TestFactory::new();

        let bad = ExecutorManagerConfig::new(vec![ExecutorConfig::new(
            "ns",
            Duration::from_millis(10),
        )]);
        let client_dyn: Arc<dyn ShardDistributorExecutorApi> = client;
        assert!(ExecutorManager::new(bad, client_dyn.clone(), factory.clone()).is_err());

        let good = ExecutorManagerConfig::new(vec![
            ExecutorConfig::new("ns-a", Duration::from_millis(200)),
            ExecutorConfig::new("ns-b", Duration::from_millis(200)),
        ]);
        let manager = ExecutorManager::new(good, client_dyn, factory).unwrap();
        assert!(manager.get_executor_for_namespace("ns-a").is_ok());
        assert!(manager.get_executor_for_namespace("missing").is_err());
    }
}
