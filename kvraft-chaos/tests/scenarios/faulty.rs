//! Broken stores the harness must catch.
//!
//! `FaultyCluster` wraps the in-memory model and corrupts what its clients
//! do, one way per [`Fault`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kvraft_chaos::scenarios::one_partition;
use kvraft_chaos::{
    AppendViolation, ClusterController, ClusterError, ClusterResult, ClusterSpec, HarnessError,
    InMemoryClient, InMemoryCluster, KeyPlan, KvClient, ScenarioConfig, ScenarioRunner, ServerId,
};

use super::init_tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Every append is applied twice.
    DuplicateAppends,
    /// Every second append is acknowledged but never applied.
    LoseAppends,
    /// A client's first append is applied after its second.
    SwapFirstAppends,
    /// Clients reach every server, whatever they were bound to.
    IgnoreBinding,
    /// The reported log never shrinks.
    BloatedLog,
    /// Installing a partition takes two seconds and appends never return.
    SlowPartition,
    /// Healing the network always fails.
    RejectHeal,
}

struct FaultyCluster {
    inner: InMemoryCluster,
    fault: Fault,
    partitioning: AtomicBool,
    torn_down_mid_partition: AtomicBool,
}

impl FaultyCluster {
    fn new(spec: ClusterSpec, fault: Fault) -> Self {
        Self {
            inner: InMemoryCluster::new(spec),
            fault,
            partitioning: AtomicBool::new(false),
            torn_down_mid_partition: AtomicBool::new(false),
        }
    }
}

#[derive(Clone)]
struct FaultyClient {
    inner: InMemoryClient,
    fault: Fault,
    appends: Arc<AtomicU64>,
    held: Arc<Mutex<Option<(String, String)>>>,
}

#[async_trait]
impl KvClient for FaultyClient {
    async fn get(&self, key: &str) -> ClusterResult<String> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.inner.put(key, value).await
    }

    async fn append(&self, key: &str, value: &str) -> ClusterResult<()> {
        let n = self.appends.fetch_add(1, Ordering::Relaxed);
        match self.fault {
            Fault::DuplicateAppends => {
                self.inner.append(key, value).await?;
                self.inner.append(key, value).await
            }
            Fault::LoseAppends if n % 2 == 1 => Ok(()),
            Fault::SlowPartition => std::future::pending().await,
            Fault::SwapFirstAppends if n == 0 => {
                *self.held.lock() = Some((key.to_string(), value.to_string()));
                Ok(())
            }
            Fault::SwapFirstAppends if n == 1 => {
                self.inner.append(key, value).await?;
                let held = self.held.lock().take();
                match held {
                    Some((key, value)) => self.inner.append(&key, &value).await,
                    None => Ok(()),
                }
            }
            _ => self.inner.append(key, value).await,
        }
    }
}

#[async_trait]
impl ClusterController for FaultyCluster {
    type Client = FaultyClient;

    async fn build(spec: ClusterSpec) -> ClusterResult<Self> {
        Ok(Self::new(spec, Fault::DuplicateAppends))
    }

    fn all_servers(&self) -> Vec<ServerId> {
        self.inner.all_servers()
    }

    async fn make_client(&self, servers: &[ServerId]) -> ClusterResult<FaultyClient> {
        let inner = if self.fault == Fault::IgnoreBinding {
            self.inner.make_client(&self.inner.all_servers()).await?
        } else {
            self.inner.make_client(servers).await?
        };
        Ok(FaultyClient {
            inner,
            fault: self.fault,
            appends: Arc::new(AtomicU64::new(0)),
            held: Arc::new(Mutex::new(None)),
        })
    }

    async fn release_client(&self, client: FaultyClient) -> ClusterResult<()> {
        self.inner.release_client(client.inner).await
    }

    async fn partition(&self, a: &[ServerId], b: &[ServerId]) -> ClusterResult<()> {
        if self.fault != Fault::SlowPartition {
            return self.inner.partition(a, b).await;
        }
        self.partitioning.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let result = self.inner.partition(a, b).await;
        self.partitioning.store(false, Ordering::SeqCst);
        result
    }

    async fn connect_all(&self) -> ClusterResult<()> {
        if self.fault == Fault::RejectHeal {
            return Err(ClusterError::Client("heal refused".into()));
        }
        self.inner.connect_all().await
    }

    async fn connect_client(&self, client: &FaultyClient, servers: &[ServerId]) -> ClusterResult<()> {
        self.inner.connect_client(&client.inner, servers).await
    }

    async fn shutdown_server(&self, server: ServerId) -> ClusterResult<()> {
        self.inner.shutdown_server(server).await
    }

    async fn start_server(&self, server: ServerId) -> ClusterResult<()> {
        self.inner.start_server(server).await
    }

    fn log_size(&self) -> usize {
        match self.fault {
            Fault::BloatedLog => 1_000_000,
            _ => self.inner.log_size(),
        }
    }

    fn snapshot_size(&self) -> usize {
        self.inner.snapshot_size()
    }

    fn begin(&self, title: &str) {
        self.inner.begin(title);
    }

    fn end(&self) {
        self.inner.end();
    }

    async fn cleanup(&self) -> ClusterResult<()> {
        if self.partitioning.load(Ordering::SeqCst) {
            self.torn_down_mid_partition.store(true, Ordering::SeqCst);
        }
        self.inner.cleanup().await
    }
}

async fn run_faulty(config: ScenarioConfig, fault: Fault) -> HarnessError {
    init_tracing();
    let cluster = Arc::new(FaultyCluster::new(config.cluster_spec(), fault));
    ScenarioRunner::new(config)
        .run_with(cluster)
        .await
        .expect_err("a faulty store must fail the scenario")
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_appends_are_caught() {
    let err = run_faulty(ScenarioConfig::new("3A", 2), Fault::DuplicateAppends).await;
    assert!(err.is_correctness_failure());
    assert!(matches!(
        err,
        HarnessError::Assertion(AppendViolation::Duplicate { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_appends_on_shared_key_are_caught() {
    let config = ScenarioConfig::new("3A", 2).key_plan(KeyPlan::Shared("k".into()));
    let err = run_faulty(config, Fault::DuplicateAppends).await;
    assert!(err.is_correctness_failure());
    assert!(matches!(
        err,
        HarnessError::Assertion(AppendViolation::Duplicate { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_appends_across_keys_are_caught() {
    let config = ScenarioConfig::new("3A", 3).key_plan(KeyPlan::RoundRobin);
    let err = run_faulty(config, Fault::DuplicateAppends).await;
    assert!(matches!(
        err,
        HarnessError::Assertion(AppendViolation::Duplicate { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_lost_appends_are_caught() {
    let err = run_faulty(ScenarioConfig::new("3A", 3).crash(true), Fault::LoseAppends).await;
    match err {
        HarnessError::Assertion(AppendViolation::Missing { marker, .. }) => {
            assert_eq!(marker.client, 0);
            assert_eq!(marker.seq, 1);
        }
        other => panic!("expected a missing marker, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reordered_appends_are_caught() {
    let err = run_faulty(ScenarioConfig::new("3A", 2), Fault::SwapFirstAppends).await;
    assert!(matches!(
        err,
        HarnessError::Assertion(AppendViolation::Misordered { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_untrimmed_log_is_caught() {
    let config = ScenarioConfig::new("3B", 1).max_raft_state(Some(1000));
    let err = run_faulty(config, Fault::BloatedLog).await;
    assert!(matches!(
        err,
        HarnessError::BoundViolation {
            what: "raft log",
            limit: 2000,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_minority_progress_is_caught() {
    init_tracing();
    let cluster = Arc::new(FaultyCluster::new(ClusterSpec::new(5), Fault::IgnoreBinding));
    let err = one_partition(cluster.clone())
        .await
        .expect_err("minority must not make progress");
    cluster.cleanup().await.expect("cleanup");

    assert!(err.is_correctness_failure());
    assert!(matches!(err, HarnessError::UnexpectedProgress { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_sessions_wait_for_the_injector_before_teardown() {
    init_tracing();
    let config = ScenarioConfig::new("3A", 2)
        .partitions(true)
        .session_timeout(Duration::from_secs(1));
    let cluster = Arc::new(FaultyCluster::new(config.cluster_spec(), Fault::SlowPartition));

    let err = ScenarioRunner::new(config)
        .run_with(cluster.clone())
        .await
        .expect_err("sessions never finish");

    assert!(matches!(err, HarnessError::Timeout { .. }));
    assert!(!cluster.partitioning.load(Ordering::SeqCst));
    assert!(!cluster.torn_down_mid_partition.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_blocked_minority_ops_end_with_the_scenario() {
    init_tracing();
    let cluster = Arc::new(FaultyCluster::new(ClusterSpec::new(5), Fault::RejectHeal));
    let err = one_partition(cluster.clone())
        .await
        .expect_err("heal fails");
    assert!(matches!(err, HarnessError::Cluster(ClusterError::Client(_))));
    assert!(!err.is_correctness_failure());

    // minority clients retry every 100ms for as long as they run
    tokio::time::sleep(Duration::from_millis(10)).await;
    let rpcs = cluster.inner.rpc_count();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cluster.inner.rpc_count(), rpcs);

    cluster.cleanup().await.expect("cleanup");
}
