//! Subscription contract: heartbeat-only traffic is silent, real
//! changes collapse to single notifications.

use super::TestHarness;
use crate::rpc::ShardDistributorExecutorApi;
use crate::store::{EventType, StateWatch};
use crate::types::{ExecutorHeartbeatRequest, ExecutorStatus, ShardReport};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;

fn heartbeat(executor_id: &str, reports: &[(&str, f64)]) -> ExecutorHeartbeatRequest {
    ExecutorHeartbeatRequest {
        namespace: "ns".to_string(),
        executor_id: executor_id.to_string(),
        status: ExecutorStatus::Active,
        shard_status_reports: reports
            .iter()
            .map(|(shard, load)| (shard.to_string(), ShardReport::ready(*load)))
            .collect(),
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn test_heartbeat_only_traffic_is_suppressed() {
    let harness = TestHarness::start_without_reconcilers(
        TestHarness::fast_config("/subscribe").with_ephemeral_namespace("ns"),
    )
    .await
    .unwrap();

    harness
        .distributor
        .heartbeat(heartbeat("e1", &[("s1", 0.5)]))
        .await
        .unwrap();

    let mut events = harness.store.subscribe("ns").await.unwrap();

    // Ten heartbeats with identical status and reports: the timestamp
    // moves, nothing else. The subscription must stay silent.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness
            .distributor
            .heartbeat(heartbeat("e1", &[("s1", 0.5)]))
            .await
            .unwrap();
    }
    assert!(
        timeout(Duration::from_millis(300), events.recv()).await.is_err(),
        "heartbeat-only updates must not wake subscribers"
    );

    // A changed report fires exactly one collapsed notification.
    harness
        .distributor
        .heartbeat(heartbeat("e1", &[("s1", 0.9)]))
        .await
        .unwrap();
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("report change must produce an event")
        .unwrap();
    assert!(event.has_event(EventType::ExecutorReportShardsChanged));
    assert!(
        timeout(Duration::from_millis(300), events.recv()).await.is_err(),
        "one change must produce one notification"
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_burst_collapses_to_one_notification() {
    let harness = TestHarness::start_without_reconcilers(
        TestHarness::fast_config("/burst").with_ephemeral_namespace("ns"),
    )
    .await
    .unwrap();

    harness
        .distributor
        .heartbeat(heartbeat("e1", &[]))
        .await
        .unwrap();
    let mut events = harness.store.subscribe("ns").await.unwrap();

    // A burst of distinct report changes without the subscriber reading:
    // the pending notification merges them.
    for i in 0..5 {
        harness
            .distributor
            .heartbeat(heartbeat("e1", &[("s1", i as f64)]))
            .await
            .unwrap();
    }

    // Give the relay a moment to fold the burst, then read: the first
    // event is a merged batch carrying the latest revision.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("burst must produce a notification")
        .unwrap();
    assert!(event.has_event(EventType::ExecutorReportShardsChanged));
    assert!(event.revision > 0);

    // At most one more batch may trail (a send raced the burst); after
    // that the stream is quiet.
    let _ = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(
        timeout(Duration::from_millis(300), events.recv()).await.is_err(),
        "burst must collapse instead of queueing"
    );

    harness.stop().await;
}
