use std::sync::Arc;
use std::time::Duration;

use kvraft_chaos::scenarios::{
    SNAPSHOT_MAX_RAFT_STATE, one_partition, snapshot_rpc, snapshot_size, unreliable_one_key,
};
use kvraft_chaos::{
    ClusterController, ClusterError, ClusterSpec, HarnessError, InMemoryCluster, ModelOptions,
};

use super::init_tracing;

#[tokio::test(start_paused = true)]
async fn test_one_partition() {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(5)));
    one_partition(cluster.clone()).await.expect("one partition");
    cluster.cleanup().await.expect("cleanup");
}

#[tokio::test(start_paused = true)]
async fn test_one_partition_needs_five_servers() {
    let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(3)));
    let err = one_partition(cluster).await.expect_err("wrong topology");
    assert!(matches!(err, HarnessError::InvalidConfig(_)));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_in_minority_window_is_not_progress() {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(5)));
    let scenario = tokio::spawn(one_partition(cluster.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster.cleanup().await.expect("cleanup");

    let err = scenario
        .await
        .expect("scenario task")
        .expect_err("torn down cluster");
    assert!(!err.is_correctness_failure());
    assert!(matches!(err, HarnessError::Cluster(ClusterError::TornDown)));
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_one_key() {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::with_options(
        ClusterSpec::new(3).unreliable(true),
        ModelOptions::default().seed(21),
    ));
    unreliable_one_key(cluster.clone()).await.expect("one key");
    assert!(cluster.rpc_count() > cluster.applied_ops());
    cluster.cleanup().await.expect("cleanup");
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_rpc() {
    init_tracing();
    let spec = ClusterSpec::new(3).max_raft_state(Some(SNAPSHOT_MAX_RAFT_STATE));
    let cluster = Arc::new(InMemoryCluster::new(spec));
    snapshot_rpc(cluster.clone()).await.expect("snapshot rpc");
    assert!(cluster.snapshot_size() > 0);
    cluster.cleanup().await.expect("cleanup");
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_size() {
    init_tracing();
    let spec = ClusterSpec::new(3).max_raft_state(Some(SNAPSHOT_MAX_RAFT_STATE));
    let cluster = Arc::new(InMemoryCluster::new(spec));
    snapshot_size(cluster.clone()).await.expect("snapshot size");
    assert!(cluster.log_size() <= 2 * SNAPSHOT_MAX_RAFT_STATE);
    cluster.cleanup().await.expect("cleanup");
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_size_without_snapshots_fails() {
    let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(3)));
    let err = snapshot_size(cluster).await.expect_err("log never trimmed");
    assert!(matches!(err, HarnessError::BoundViolation { what: "raft log", .. }));
}
