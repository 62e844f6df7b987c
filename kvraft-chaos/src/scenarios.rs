//! Fixed-topology scenarios.
//!
//! Unlike the generic [`ScenarioRunner`](crate::ScenarioRunner), these drive
//! the cluster by hand to pin down one property each:
//!
//! | Scenario | Servers | Property |
//! |----------|---------|----------|
//! | [`one_partition`] | 5 | majority progresses, minority blocks, blocked ops finish after heal |
//! | [`unreliable_one_key`] | 3 | concurrent appends to one key over a lossy network apply exactly once |
//! | [`snapshot_rpc`] | 3 | a lagging server catches up, the majority trims its log |
//! | [`snapshot_size`] | 3 | log and snapshot stay bounded under repeated overwrites |
//!
//! Each function expects a freshly built cluster with the listed server
//! count and leaves teardown to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::info;

use crate::cluster::{ClusterController, KvClient, ServerId};
use crate::error::{HarnessError, HarnessResult};
use crate::partitioner::PartitionAssignment;
use crate::scenario::ELECTION_TIMEOUT;
use crate::verifier::{check_concurrent_appends, check_value};
use crate::workload::{AbortOnDrop, AppendWorkload, KeyPlan, OpCounter, spawn_clients_and_wait};

/// Window in which a minority operation must not complete.
const MINORITY_WINDOW: Duration = Duration::from_secs(1);
/// Window in which a blocked operation must complete after the heal.
const HEAL_WINDOW: Duration = Duration::from_secs(3);

/// Snapshot threshold used by the snapshot scenarios.
pub const SNAPSHOT_MAX_RAFT_STATE: usize = 1000;
/// Largest acceptable snapshot in [`snapshot_size`].
pub const SNAPSHOT_MAX_SIZE: usize = 500;

fn require_servers<C: ClusterController>(cluster: &C, expected: usize) -> HarnessResult<Vec<ServerId>> {
    let servers = cluster.all_servers();
    if servers.len() == expected {
        Ok(servers)
    } else {
        Err(HarnessError::InvalidConfig(format!(
            "scenario needs {expected} servers, cluster has {}",
            servers.len()
        )))
    }
}

async fn check<K: KvClient>(ck: &K, ops: &OpCounter, key: &str, expected: &str) -> HarnessResult<()> {
    ops.record();
    let actual = ck.get(key).await?;
    check_value(key, expected, &actual)?;
    Ok(())
}

async fn put<K: KvClient>(ck: &K, ops: &OpCounter, key: &str, value: &str) -> HarnessResult<()> {
    ops.record();
    ck.put(key, value).await?;
    Ok(())
}

fn check_log_trimmed<C: ClusterController>(cluster: &C, max_raft_state: usize) -> HarnessResult<()> {
    let log_size = cluster.log_size();
    if log_size > 2 * max_raft_state {
        return Err(HarnessError::BoundViolation {
            what: "raft log",
            actual: log_size,
            limit: 2 * max_raft_state,
        });
    }
    Ok(())
}

/// Progress in the majority, none in the minority, completion after heal.
///
/// Splits five servers into a three-server majority and a two-server
/// minority. A put through the majority succeeds. A put and a get issued
/// through minority-bound clients must stay blocked for one second. After
/// the network heals and both clients are rebound to every server, both
/// operations must complete, and the blocked put's value must win.
pub async fn one_partition<C: ClusterController>(cluster: Arc<C>) -> HarnessResult<()> {
    let servers = require_servers(cluster.as_ref(), 5)?;
    let ops = OpCounter::new();
    let ck = cluster.make_client(&servers).await?;

    put(&ck, &ops, "1", "13").await?;

    cluster.begin("Test: progress in majority (3A)");
    let split = PartitionAssignment::split(&servers, servers.len() / 2 + 1);
    let (majority, minority) = (split.group_a, split.group_b);
    cluster.partition(&majority, &minority).await?;

    let ckp1 = cluster.make_client(&majority).await?;
    let ckp2a = cluster.make_client(&minority).await?;
    let ckp2b = cluster.make_client(&minority).await?;

    put(&ckp1, &ops, "1", "14").await?;
    check(&ckp1, &ops, "1", "14").await?;
    cluster.end();

    cluster.begin("Test: no progress in minority (3A)");
    let (put_tx, mut put_rx) = oneshot::channel();
    let (get_tx, mut get_rx) = oneshot::channel();
    ops.record();
    let blocked_put = tokio::spawn({
        let ck = ckp2a.clone();
        async move {
            let result = ck.put("1", "15").await;
            let _ = put_tx.send(result);
        }
    });
    ops.record();
    let blocked_get = tokio::spawn({
        let ck = ckp2b.clone();
        async move {
            let result = ck.get("1").await;
            let _ = get_tx.send(result);
        }
    });

    let mut blocked = AbortOnDrop::default();
    blocked.push(blocked_put.abort_handle());
    blocked.push(blocked_get.abort_handle());

    let finished = tokio::select! {
        sent = &mut put_rx => Some(("Put in minority", sent.map(|result| result.map(drop)))),
        sent = &mut get_rx => Some(("Get in minority", sent.map(|result| result.map(drop)))),
        _ = tokio::time::sleep(MINORITY_WINDOW) => None,
    };
    if let Some((what, sent)) = finished {
        // only a successful reply is progress, a failed call is the cluster's error
        return Err(match sent {
            Ok(Ok(())) => HarnessError::UnexpectedProgress { what: what.into() },
            Ok(Err(err)) => HarnessError::Cluster(err),
            Err(_) => HarnessError::TaskFailed {
                task: what.into(),
                reason: "exited without a result".into(),
            },
        });
    }

    check(&ckp1, &ops, "1", "14").await?;
    put(&ckp1, &ops, "1", "16").await?;
    check(&ckp1, &ops, "1", "16").await?;
    cluster.end();

    cluster.begin("Test: completion after heal (3A)");
    cluster.connect_all().await?;
    cluster.connect_client(&ckp2a, &servers).await?;
    cluster.connect_client(&ckp2b, &servers).await?;
    tokio::time::sleep(ELECTION_TIMEOUT).await;

    match tokio::time::timeout(HEAL_WINDOW, &mut put_rx).await {
        Ok(Ok(result)) => result?,
        Ok(Err(_)) => {
            return Err(HarnessError::TaskFailed {
                task: "minority put".into(),
                reason: "exited without a result".into(),
            });
        }
        Err(_) => {
            return Err(HarnessError::Timeout {
                what: "Put to complete after heal".into(),
                waited: HEAL_WINDOW,
            });
        }
    }
    match tokio::time::timeout(HEAL_WINDOW, &mut get_rx).await {
        Ok(Ok(result)) => {
            result?;
        }
        Ok(Err(_)) => {
            return Err(HarnessError::TaskFailed {
                task: "minority get".into(),
                reason: "exited without a result".into(),
            });
        }
        Err(_) => {
            return Err(HarnessError::Timeout {
                what: "Get to complete after heal".into(),
                waited: HEAL_WINDOW,
            });
        }
    }

    check(&ck, &ops, "1", "15").await?;
    cluster.end();

    for client in [ck, ckp1, ckp2a, ckp2b] {
        cluster.release_client(client).await?;
    }
    info!(operations = ops.count(), "one_partition passed");
    Ok(())
}

/// Five clients append ten markers each to the same key over an unreliable
/// network; every marker must land exactly once and in order per client.
pub async fn unreliable_one_key<C: ClusterController>(cluster: Arc<C>) -> HarnessResult<()> {
    const CLIENTS: usize = 5;
    const UPTO: u64 = 10;
    const KEY: &str = "k";

    let servers = require_servers(cluster.as_ref(), 3)?;
    let ops = Arc::new(OpCounter::new());
    let ck = cluster.make_client(&servers).await?;

    cluster.begin("Test: concurrent append to same key, unreliable (3A)");
    put(&ck, &ops, KEY, "").await?;

    let workload = AppendWorkload::new(CLIENTS)
        .plan(KeyPlan::Shared(KEY.to_string()))
        .appends_per_client(UPTO);
    let outcomes = spawn_clients_and_wait(cluster.clone(), CLIENTS, ops.clone(), move |session| {
        let workload = workload.clone();
        async move { workload.run_session(session).await }
    })
    .await?;

    let counts: Vec<u64> = outcomes.iter().map(|o| o.appends).collect();
    ops.record();
    let value = ck.get(KEY).await?;
    check_concurrent_appends(&value, &counts)?;
    cluster.end();

    cluster.release_client(ck).await?;
    Ok(())
}

/// A server that missed many operations rejoins and must catch up, while
/// the majority keeps its log trimmed.
pub async fn snapshot_rpc<C: ClusterController>(cluster: Arc<C>) -> HarnessResult<()> {
    let servers = require_servers(cluster.as_ref(), 3)?;
    let ops = OpCounter::new();
    let ck = cluster.make_client(&servers).await?;

    cluster.begin("Test: InstallSnapshot RPC (3B)");
    put(&ck, &ops, "a", "A").await?;
    check(&ck, &ops, "a", "A").await?;

    // a bunch of puts into the majority partition
    cluster.partition(&[0, 1], &[2]).await?;
    {
        let ck1 = cluster.make_client(&[0, 1]).await?;
        for i in 0..50 {
            put(&ck1, &ops, &i.to_string(), &i.to_string()).await?;
        }
        tokio::time::sleep(ELECTION_TIMEOUT).await;
        put(&ck1, &ops, "b", "B").await?;
        cluster.release_client(ck1).await?;
    }

    check_log_trimmed(cluster.as_ref(), SNAPSHOT_MAX_RAFT_STATE)?;

    // the lagging server is now needed for a majority
    cluster.partition(&[0, 2], &[1]).await?;
    {
        let ck1 = cluster.make_client(&[0, 2]).await?;
        put(&ck1, &ops, "c", "C").await?;
        put(&ck1, &ops, "d", "D").await?;
        check(&ck1, &ops, "a", "A").await?;
        check(&ck1, &ops, "b", "B").await?;
        check(&ck1, &ops, "1", "1").await?;
        check(&ck1, &ops, "49", "49").await?;
        cluster.release_client(ck1).await?;
    }

    cluster.partition(&servers, &[]).await?;
    put(&ck, &ops, "e", "E").await?;
    check(&ck, &ops, "c", "C").await?;
    check(&ck, &ops, "e", "E").await?;
    check(&ck, &ops, "1", "1").await?;
    cluster.end();

    cluster.release_client(ck).await?;
    Ok(())
}

/// Two hundred rounds of overwrites must leave the log trimmed and the
/// snapshot small.
pub async fn snapshot_size<C: ClusterController>(cluster: Arc<C>) -> HarnessResult<()> {
    let servers = require_servers(cluster.as_ref(), 3)?;
    let ops = OpCounter::new();
    let ck = cluster.make_client(&servers).await?;

    cluster.begin("Test: snapshot size is reasonable (3B)");
    for _ in 0..200 {
        put(&ck, &ops, "x", "0").await?;
        check(&ck, &ops, "x", "0").await?;
        put(&ck, &ops, "x", "1").await?;
        check(&ck, &ops, "x", "1").await?;
    }

    check_log_trimmed(cluster.as_ref(), SNAPSHOT_MAX_RAFT_STATE)?;

    let snapshot = cluster.snapshot_size();
    if snapshot > SNAPSHOT_MAX_SIZE {
        return Err(HarnessError::BoundViolation {
            what: "snapshot",
            actual: snapshot,
            limit: SNAPSHOT_MAX_SIZE,
        });
    }
    cluster.end();

    cluster.release_client(ck).await?;
    Ok(())
}
