//! Binary target running the standard scenario matrix and the fixed-topology
//! scenarios against the in-memory reference cluster.
//!
//! An optional argument filters scenarios by title substring.

use std::sync::Arc;

use kvraft_chaos::scenarios::{
    SNAPSHOT_MAX_RAFT_STATE, one_partition, snapshot_rpc, snapshot_size, unreliable_one_key,
};
use kvraft_chaos::{
    ClusterController, ClusterSpec, HarnessResult, InMemoryCluster, ScenarioRunner, standard_matrix,
};

async fn run_fixed<F, Fut>(name: &str, spec: ClusterSpec, scenario: F) -> HarnessResult<()>
where
    F: FnOnce(Arc<InMemoryCluster>) -> Fut,
    Fut: std::future::Future<Output = HarnessResult<()>>,
{
    let cluster = Arc::new(InMemoryCluster::build(spec).await?);
    let result = scenario(cluster.clone()).await;
    cluster.cleanup().await?;
    match &result {
        Ok(()) => println!("✅ {name}"),
        Err(e) => println!("❌ {name}: {e}"),
    }
    result
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let filter = std::env::args().nth(1);
    let selected = |title: &str| filter.as_deref().is_none_or(|f| title.contains(f));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .expect("Failed to build runtime");

    let failures = runtime.block_on(async {
        let mut failures = 0usize;

        for config in standard_matrix() {
            let title = config.title();
            if !selected(&title) {
                continue;
            }
            match ScenarioRunner::new(config).run::<InMemoryCluster>().await {
                Ok(report) => println!("{report}"),
                Err(e) => {
                    println!("❌ {title}: {e}");
                    failures += 1;
                }
            }
        }

        let snapshots = ClusterSpec::new(3).max_raft_state(Some(SNAPSHOT_MAX_RAFT_STATE));
        let mut fixed = Vec::new();
        if selected("one_partition") {
            fixed.push(run_fixed("one_partition", ClusterSpec::new(5), one_partition).await);
        }
        if selected("unreliable_one_key") {
            let spec = ClusterSpec::new(3).unreliable(true);
            fixed.push(run_fixed("unreliable_one_key", spec, unreliable_one_key).await);
        }
        if selected("snapshot_rpc") {
            fixed.push(run_fixed("snapshot_rpc", snapshots.clone(), snapshot_rpc).await);
        }
        if selected("snapshot_size") {
            fixed.push(run_fixed("snapshot_size", snapshots, snapshot_size).await);
        }
        failures += fixed.iter().filter(|r| r.is_err()).count();
        failures
    });

    if failures > 0 {
        eprintln!("{failures} scenario(s) failed");
        std::process::exit(1);
    }
}
