//! End-to-end executor lifecycle: join, assignment, drain, hand-off,
//! expiry.

use super::{wait_for, TestHarness};
use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::executor::{Executor, ShardProcessor, ShardProcessorFactory};
use crate::router::METADATA_GRPC_ADDRESS;
use crate::rpc::ShardDistributorApi;
use crate::store::StateWatch;
use crate::types::{ExecutorStatus, GetShardOwnerRequest, ShardKey, ShardReport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct NoopProcessor;

#[async_trait::async_trait]
impl ShardProcessor for NoopProcessor {
    async fn start(&self, _shutdown: CancellationToken) {}
    async fn stop(&self) {}
    fn get_shard_report(&self) -> ShardReport {
        ShardReport::ready(1.0)
    }
}

struct NoopFactory;

impl ShardProcessorFactory for NoopFactory {
    type Processor = NoopProcessor;

    fn new_shard_processor(&self, _shard_key: &ShardKey) -> Result<NoopProcessor> {
        Ok(NoopProcessor)
    }
}

fn worker(harness: &TestHarness, executor_id: &str, address: &str) -> Arc<Executor<NoopFactory>> {
    let config = ExecutorConfig::new("orders", Duration::from_millis(50))
        .with_executor_id(executor_id)
        .with_metadata(METADATA_GRPC_ADDRESS, address);
    Arc::new(Executor::new(
        config,
        harness.distributor.clone(),
        Arc::new(NoopFactory),
    ))
}

#[tokio::test]
async fn test_single_executor_lifecycle() {
    let harness = TestHarness::start(
        TestHarness::fast_config("/lifecycle").with_fixed_namespace("orders", 2),
    )
    .await
    .unwrap();

    // E1 joins and receives both shards.
    let e1 = worker(&harness, "e1", "10.0.0.1:7933");
    e1.start();
    wait_for("e1 to run both shards", Duration::from_secs(5), || {
        let e1 = e1.clone();
        async move { e1.processor_count() == 2 }
    })
    .await;

    for shard in ["0", "1"] {
        let response = harness
            .distributor
            .get_shard_owner(GetShardOwnerRequest {
                namespace: "orders".to_string(),
                shard_key: shard.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.owner, "e1");
    }

    // E2 joins, E1 drains: both shards must move to E2 and E1's local
    // processors must be withdrawn by the assignment responses.
    let e2 = worker(&harness, "e2", "10.0.0.2:7933");
    e2.start();
    e1.set_status(ExecutorStatus::Draining);

    wait_for("shards to move to e2", Duration::from_secs(5), || {
        let (e1, e2) = (e1.clone(), e2.clone());
        async move { e1.processor_count() == 0 && e2.processor_count() == 2 }
    })
    .await;

    let response = harness
        .distributor
        .get_shard_owner(GetShardOwnerRequest {
            namespace: "orders".to_string(),
            shard_key: "0".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.owner, "e2");

    // E1 finishes draining and goes away; the reconciler expires the
    // record once its heartbeat passes the TTL.
    e1.set_status(ExecutorStatus::Drained);
    tokio::time::sleep(Duration::from_millis(200)).await;
    e1.stop();

    let store = harness.store.clone();
    wait_for("e1 record to be expired", Duration::from_secs(8), move || {
        let store = store.clone();
        async move {
            let state = store.get_state("orders").await.unwrap();
            !state.executors.contains_key("e1")
        }
    })
    .await;

    // Ownership is unaffected by the deletion.
    let response = harness
        .distributor
        .get_shard_owner(GetShardOwnerRequest {
            namespace: "orders".to_string(),
            shard_key: "1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.owner, "e2");

    e2.stop();
    harness.stop().await;
}

#[tokio::test]
async fn test_two_executors_split_shards() {
    let harness = TestHarness::start(
        TestHarness::fast_config("/split").with_fixed_namespace("orders", 4),
    )
    .await
    .unwrap();

    let e1 = worker(&harness, "e1", "10.0.0.1:7933");
    let e2 = worker(&harness, "e2", "10.0.0.2:7933");
    e1.start();
    e2.start();

    wait_for("both executors to run shards", Duration::from_secs(5), || {
        let (e1, e2) = (e1.clone(), e2.clone());
        async move { e1.processor_count() + e2.processor_count() == 4 }
    })
    .await;

    // The spread policy balances evenly.
    assert_eq!(e1.processor_count(), 2);
    assert_eq!(e2.processor_count(), 2);

    e1.stop();
    e2.stop();
    harness.stop().await;
}
