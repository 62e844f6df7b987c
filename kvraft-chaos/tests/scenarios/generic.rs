use std::sync::Arc;
use std::time::Duration;

use kvraft_chaos::{
    AppendWorkload, ClusterController, ClusterSpec, HarnessError, InMemoryCluster, KeyPlan,
    KvClient, OpCounter, ScenarioConfig, ScenarioPhase, ScenarioRunner, spawn_clients_and_wait,
};

use super::init_tracing;

/// Two clients, no faults: every key holds exactly its client's markers.
#[tokio::test(start_paused = true)]
async fn test_two_clients_exact_values() {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(5)));
    let ops = Arc::new(OpCounter::new());
    let workload = AppendWorkload::new(2);

    let outcomes = spawn_clients_and_wait(cluster.clone(), 2, ops, move |session| {
        let workload = workload.clone();
        async move { workload.run_session(session).await }
    })
    .await
    .expect("sessions");
    assert_eq!(outcomes.len(), 2);

    let ck = cluster
        .make_client(&cluster.all_servers())
        .await
        .expect("client");
    assert_eq!(ck.get("0").await.expect("get"), "x 0 0 yx 0 1 y");
    assert_eq!(ck.get("1").await.expect("get"), "x 1 0 yx 1 1 y");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_scenario_passes() {
    init_tracing();
    let report = ScenarioRunner::new(ScenarioConfig::new("3A", 2))
        .run::<InMemoryCluster>()
        .await
        .expect("scenario");

    assert_eq!(report.title, "Test: many clients (3A)");
    assert_eq!(report.appends_per_client, vec![2, 2]);
    // 2 puts, 4 appends, 2 verification reads
    assert_eq!(report.operations, 8);
    assert_eq!(
        report.phases,
        vec![
            ScenarioPhase::Init,
            ScenarioPhase::RunningWorkload,
            ScenarioPhase::Stopping,
            ScenarioPhase::Verifying,
            ScenarioPhase::Done,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_partitions_while_clients_run() {
    init_tracing();
    let config = ScenarioConfig::new("3A", 5)
        .unreliable(true)
        .partitions(true)
        .appends_per_client(100)
        .seed(11);
    let report = ScenarioRunner::new(config)
        .run::<InMemoryCluster>()
        .await
        .expect("scenario");

    assert!(report.partitions_installed >= 1);
    assert_eq!(report.total_appends(), 500);
    assert!(report.phases.contains(&ScenarioPhase::Partitioning));
}

#[tokio::test(start_paused = true)]
async fn test_crash_restart_keeps_appends() {
    init_tracing();
    let config = ScenarioConfig::new("3A", 5).crash(true).partitions(true);
    let report = ScenarioRunner::new(config)
        .run::<InMemoryCluster>()
        .await
        .expect("scenario");

    assert!(report.phases.contains(&ScenarioPhase::CrashRestart));
    assert_eq!(report.appends_per_client, vec![5; 5]);
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_keep_log_bounded() {
    init_tracing();
    let config = ScenarioConfig::new("3B", 20)
        .crash(true)
        .max_raft_state(Some(1000));
    let report = ScenarioRunner::new(config)
        .run::<InMemoryCluster>()
        .await
        .expect("scenario");

    assert!(report.log_size <= 2000);
    assert!(report.snapshot_size > 0);
    assert_eq!(report.total_appends(), 400);
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_keys() {
    init_tracing();
    let config = ScenarioConfig::new("3A", 3)
        .key_plan(KeyPlan::RoundRobin)
        .appends_per_client(6)
        .unreliable(true)
        .seed(5);
    let report = ScenarioRunner::new(config)
        .run::<InMemoryCluster>()
        .await
        .expect("scenario");
    assert_eq!(report.appends_per_client, vec![6, 6, 6]);
}

#[tokio::test(start_paused = true)]
async fn test_shared_key() {
    init_tracing();
    let config = ScenarioConfig::new("3A", 4)
        .key_plan(KeyPlan::Shared("k".into()))
        .appends_per_client(10)
        .partitions(true);
    let report = ScenarioRunner::new(config)
        .run::<InMemoryCluster>()
        .await
        .expect("scenario");
    assert_eq!(report.total_appends(), 40);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_cluster_times_out() {
    init_tracing();
    let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(5)));
    let config = ScenarioConfig::new("3A", 2).session_timeout(Duration::from_secs(5));
    let runner = ScenarioRunner::new(config);

    for server in [0, 1, 2] {
        cluster.shutdown_server(server).await.expect("shutdown");
    }

    let err = runner
        .run_with(cluster.clone())
        .await
        .expect_err("no quorum, no progress");
    assert!(matches!(err, HarnessError::Timeout { .. }));
    assert!(!err.is_correctness_failure());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected() {
    let err = ScenarioRunner::new(ScenarioConfig::new("3A", 0))
        .run::<InMemoryCluster>()
        .await
        .expect_err("zero clients");
    assert!(matches!(err, HarnessError::InvalidConfig(_)));
}
