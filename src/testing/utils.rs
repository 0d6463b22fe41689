//! Shared test fixtures.

use crate::config::DistributionConfig;
use crate::distributor::ShardDistributor;
use crate::election::KvElector;
use crate::error::Result;
use crate::kv::MemoryKv;
use crate::reconciler::{ReconcilerSet, SpreadPlacementPolicy};
use crate::router::{Peer, PeerTransport};
use crate::store::KvExecutorStore;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll an async condition until it holds, panicking after the deadline.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out after {timeout:?} waiting for {what}"))
}

/// A full in-process distributor: memory KV, store, elector,
/// reconcilers, and handlers.
pub struct TestHarness {
    pub kv: Arc<MemoryKv>,
    pub store: Arc<KvExecutorStore>,
    pub elector: Arc<KvElector>,
    pub distributor: Arc<ShardDistributor>,
    reconcilers: Option<ReconcilerSet>,
}

impl TestHarness {
    /// A config tuned for fast tests: sub-second reconcile cadence and a
    /// short executor TTL.
    pub fn fast_config(prefix: &str) -> DistributionConfig {
        let mut config = DistributionConfig::new(prefix);
        config.election.leader_period = Duration::from_secs(2);
        config.reconcile.interval = Duration::from_millis(150);
        config.reconcile.debounce = Duration::from_millis(20);
        config.reconcile.executor_ttl = Duration::from_secs(1);
        config.reconcile.max_retries = 3;
        config
    }

    /// Start the harness with reconcilers running for every configured
    /// namespace.
    pub async fn start(config: DistributionConfig) -> Result<Self> {
        Self::build(config, true).await
    }

    /// Start the harness without reconcilers (tests drive assignments
    /// themselves).
    pub async fn start_without_reconcilers(config: DistributionConfig) -> Result<Self> {
        Self::build(config, false).await
    }

    async fn build(config: DistributionConfig, reconcile: bool) -> Result<Self> {
        let kv = Arc::new(MemoryKv::new());
        let store = KvExecutorStore::new(kv.clone(), config.store.prefix.clone());
        let elector = Arc::new(KvElector::new(
            kv.clone(),
            config.store.prefix.clone(),
            &config.election,
        ));
        let distributor = Arc::new(ShardDistributor::new(store.clone(), config.clone())?);

        let reconcilers = reconcile.then(|| {
            ReconcilerSet::spawn(
                config.namespaces.clone(),
                store.clone(),
                elector.clone(),
                Arc::new(SpreadPlacementPolicy),
                config.reconcile.clone(),
                "test-harness",
                distributor.metrics(),
            )
        });

        Ok(Self {
            kv,
            store,
            elector,
            distributor,
            reconcilers,
        })
    }

    /// Stop reconcilers and background tasks.
    pub async fn stop(mut self) {
        if let Some(reconcilers) = self.reconcilers.take() {
            reconcilers.stop().await;
        }
        self.store.stop();
    }
}

/// A peer identified by its address, with no live connection behind it.
pub struct StaticPeer {
    address: String,
}

impl Peer for StaticPeer {
    fn identifier(&self) -> &str {
        &self.address
    }
}

/// Transport that counts retains and releases.
pub struct RecordingTransport {
    pub retains: AtomicUsize,
    pub releases: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            retains: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            retains: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }
}

impl PeerTransport for RecordingTransport {
    fn retain_peer(&self, address: &str) -> Result<Arc<dyn Peer>> {
        self.retains.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StaticPeer {
            address: address.to_string(),
        }))
    }

    fn release_peer(&self, _peer: Arc<dyn Peer>) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
