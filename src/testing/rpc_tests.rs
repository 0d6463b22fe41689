//! RPC round trips over real TCP connections.

use super::TestHarness;
use crate::error::Error;
use crate::rpc::{
    DistributorServer, RpcClient, ShardDistributorApi, ShardDistributorExecutorApi,
};
use crate::types::{
    ExecutorHeartbeatRequest, ExecutorStatus, GetShardOwnerRequest, NewEphemeralShardRequest,
};
use std::collections::HashMap;
use std::sync::Arc;

async fn serve(harness: &TestHarness) -> (RpcClient, tokio_util::sync::CancellationToken) {
    let server = DistributorServer::bind("127.0.0.1:0".parse().unwrap(), harness.distributor.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run());
    (RpcClient::new(addr.to_string()), shutdown)
}

fn heartbeat(executor_id: &str) -> ExecutorHeartbeatRequest {
    ExecutorHeartbeatRequest {
        namespace: "ns".to_string(),
        executor_id: executor_id.to_string(),
        status: ExecutorStatus::Active,
        shard_status_reports: HashMap::new(),
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn test_heartbeat_and_lookup_over_tcp() {
    let harness = TestHarness::start_without_reconcilers(
        TestHarness::fast_config("/rpc").with_ephemeral_namespace("ns"),
    )
    .await
    .unwrap();
    let (client, shutdown) = serve(&harness).await;

    // Heartbeat registers the executor.
    let response = client.heartbeat(heartbeat("e1")).await.unwrap();
    assert!(response.shard_assignments.is_empty());

    // Ephemeral shard creation routes through the store and back.
    let response = client
        .new_ephemeral_shard(NewEphemeralShardRequest {
            namespace: "ns".to_string(),
            shard_key: "sess-1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.owner, "e1");

    let response = client
        .get_shard_owner(GetShardOwnerRequest {
            namespace: "ns".to_string(),
            shard_key: "sess-1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.owner, "e1");
    assert_eq!(response.namespace, "ns");

    // The next heartbeat reflects the assignment.
    let response = client.heartbeat(heartbeat("e1")).await.unwrap();
    assert!(response.shard_assignments.contains_key("sess-1"));

    shutdown.cancel();
    harness.stop().await;
}

#[tokio::test]
async fn test_typed_errors_cross_the_wire() {
    let harness = TestHarness::start_without_reconcilers(
        TestHarness::fast_config("/rpc-errors").with_ephemeral_namespace("ns"),
    )
    .await
    .unwrap();
    let (client, shutdown) = serve(&harness).await;

    // Unknown namespace.
    let err = client
        .get_shard_owner(GetShardOwnerRequest {
            namespace: "nope".to_string(),
            shard_key: "s1".to_string(),
        })
        .await
        .unwrap_err();
    match err {
        Error::Remote { code, message } => {
            assert_eq!(code, "not_found");
            assert!(message.contains("namespace"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Unowned shard in a known namespace.
    let err = client
        .get_shard_owner(GetShardOwnerRequest {
            namespace: "ns".to_string(),
            shard_key: "unowned".to_string(),
        })
        .await
        .unwrap_err();
    match err {
        Error::Remote { code, .. } => assert_eq!(code, "not_found"),
        other => panic!("unexpected error: {other}"),
    }

    shutdown.cancel();
    harness.stop().await;
}

#[tokio::test]
async fn test_client_is_shareable_across_tasks() {
    let harness = TestHarness::start_without_reconcilers(
        TestHarness::fast_config("/rpc-share").with_ephemeral_namespace("ns"),
    )
    .await
    .unwrap();
    let (client, shutdown) = serve(&harness).await;
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.heartbeat(heartbeat(&format!("e{i}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    shutdown.cancel();
    harness.stop().await;
}
