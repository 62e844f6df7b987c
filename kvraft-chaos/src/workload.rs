//! Client workload driver.
//!
//! A scenario runs `n` independent [`ClientSession`]s, one tokio task each.
//! A session owns a client handle bound to every server, issues its
//! operations strictly one after another, and records every append it got
//! acknowledged in a per-key [`AppendLog`]. Sessions never look at the stop
//! signal: they run a fixed number of iterations and simply block inside a
//! client call while their servers sit in a minority partition.
//!
//! [`spawn_clients_and_wait`] is the fan-out/fan-in primitive: it returns
//! once every session finished, or as soon as one failed (the rest are
//! aborted). [`AppendWorkload`] is the standard session body used by the
//! scenario runner.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::select_all;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

use crate::cluster::{ClusterController, KvClient};
use crate::error::{HarnessError, HarnessResult};
use crate::verifier::{AppendLog, Marker};

/// How a session's appends are spread over keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPlan {
    /// Client `c` initializes key `"c"` and appends only to it.
    #[default]
    OwnKey,
    /// Client `c`'s `j`-th append goes to key `j mod n`.
    RoundRobin,
    /// Every client appends to the same key.
    Shared(String),
}

impl KeyPlan {
    /// Key that client `client` uses for its `append`-th append.
    pub fn key_for(&self, client: usize, append: u64, n_clients: usize) -> String {
        match self {
            KeyPlan::OwnKey => client.to_string(),
            KeyPlan::RoundRobin => (append % n_clients.max(1) as u64).to_string(),
            KeyPlan::Shared(key) => key.clone(),
        }
    }

    /// Whether each session initializes its own key before appending.
    pub fn session_initializes_key(&self) -> bool {
        matches!(self, KeyPlan::OwnKey)
    }

    /// Keys the control client must initialize before sessions start.
    ///
    /// Shared keys are written up front: an initializing put issued by one
    /// session could overwrite another session's acknowledged appends.
    pub fn control_keys(&self, n_clients: usize) -> Vec<String> {
        match self {
            KeyPlan::OwnKey => Vec::new(),
            KeyPlan::RoundRobin | KeyPlan::Shared(_) => self.keys(n_clients),
        }
    }

    /// Every logical key a run with `n_clients` sessions touches.
    pub fn keys(&self, n_clients: usize) -> Vec<String> {
        match self {
            KeyPlan::OwnKey | KeyPlan::RoundRobin => (0..n_clients).map(|k| k.to_string()).collect(),
            KeyPlan::Shared(key) => vec![key.clone()],
        }
    }
}

/// Counts client operations issued through the harness.
#[derive(Debug, Default)]
pub struct OpCounter {
    ops: AtomicU64,
}

impl OpCounter {
    /// New counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one operation.
    pub fn record(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Operations counted so far.
    pub fn count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

/// One client's private view of a run.
#[derive(Debug)]
pub struct ClientSession<K> {
    client: usize,
    handle: K,
    seq: u64,
    logs: BTreeMap<String, AppendLog>,
    ops: Arc<OpCounter>,
}

impl<K: KvClient> ClientSession<K> {
    /// Wrap a client handle for session `client`.
    pub fn new(client: usize, handle: K, ops: Arc<OpCounter>) -> Self {
        Self {
            client,
            handle,
            seq: 0,
            logs: BTreeMap::new(),
            ops,
        }
    }

    /// Index of this session.
    pub fn client(&self) -> usize {
        self.client
    }

    /// The underlying client handle.
    pub fn handle(&self) -> &K {
        &self.handle
    }

    /// Number of acknowledged appends.
    pub fn appends(&self) -> u64 {
        self.seq
    }

    /// Appends recorded for `key`.
    pub fn log(&self, key: &str) -> Option<&AppendLog> {
        self.logs.get(key)
    }

    /// Read `key`.
    pub async fn get(&self, key: &str) -> HarnessResult<String> {
        self.ops.record();
        Ok(self.handle.get(key).await?)
    }

    /// Overwrite `key`.
    pub async fn put(&mut self, key: &str, value: &str) -> HarnessResult<()> {
        self.ops.record();
        self.handle.put(key, value).await?;
        Ok(())
    }

    /// Append this session's next marker to `key` and record it.
    pub async fn append_marker(&mut self, key: &str) -> HarnessResult<Marker> {
        let marker = Marker::new(self.client, self.seq);
        self.ops.record();
        self.handle.append(key, &marker.to_string()).await?;
        self.seq += 1;
        self.logs.entry(key.to_string()).or_default().record(marker);
        Ok(marker)
    }

    /// Split the session into its handle and what it recorded.
    pub fn finish(self) -> (K, SessionOutcome) {
        let outcome = SessionOutcome {
            client: self.client,
            appends: self.seq,
            logs: self.logs,
        };
        (self.handle, outcome)
    }
}

/// What a completed session reports back to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Session index.
    pub client: usize,
    /// Number of acknowledged appends.
    pub appends: u64,
    /// Acknowledged appends per key.
    pub logs: BTreeMap<String, AppendLog>,
}

/// Spawn `n` sessions running `body` and wait for all of them.
///
/// Each session gets a fresh client bound to every server, released again
/// once the body returns. Outcomes are returned ordered by client index. The
/// first failing session wins: its error is returned and the remaining
/// sessions are aborted. A panicking session is reported as
/// [`HarnessError::ClientSession`] with its index.
pub async fn spawn_clients_and_wait<C, F, Fut>(
    cluster: Arc<C>,
    n: usize,
    ops: Arc<OpCounter>,
    body: F,
) -> HarnessResult<Vec<SessionOutcome>>
where
    C: ClusterController,
    F: Fn(ClientSession<C::Client>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HarnessResult<ClientSession<C::Client>>> + Send + 'static,
{
    if n == 0 {
        return Ok(Vec::new());
    }

    let body = Arc::new(body);
    let mut pending = Vec::with_capacity(n);
    let mut tasks = AbortOnDrop::default();

    for client in 0..n {
        let cluster = cluster.clone();
        let ops = ops.clone();
        let body = body.clone();
        let handle = tokio::spawn(async move {
            let servers = cluster.all_servers();
            let ck = cluster.make_client(&servers).await?;
            debug!(client, "session started");
            let session = (*body)(ClientSession::new(client, ck, ops)).await?;
            let (ck, outcome) = session.finish();
            cluster.release_client(ck).await?;
            debug!(client, appends = outcome.appends, "session finished");
            Ok::<_, HarnessError>(outcome)
        });
        tasks.push(handle.abort_handle());
        pending.push(handle.map(move |joined| (client, joined)));
    }

    let mut outcomes = Vec::with_capacity(n);
    while !pending.is_empty() {
        let ((client, joined), _, rest) = select_all(pending).await;
        pending = rest;

        let failure = match joined {
            Ok(Ok(outcome)) => {
                outcomes.push(outcome);
                continue;
            }
            Ok(Err(err)) => session_error(client, err),
            Err(join_err) => HarnessError::ClientSession {
                client,
                reason: format!("session task failed: {join_err}"),
            },
        };

        warn!(client, error = %failure, "client session failed, aborting the others");
        return Err(failure);
    }

    outcomes.sort_by_key(|o| o.client);
    Ok(outcomes)
}

/// Aborts the tracked tasks when dropped.
///
/// Dropping a `JoinHandle` only detaches its task. Holding the abort handles
/// here ties the tasks' lifetime to the future or scope that spawned them.
#[derive(Debug, Default)]
pub(crate) struct AbortOnDrop {
    handles: Vec<AbortHandle>,
}

impl AbortOnDrop {
    pub(crate) fn push(&mut self, handle: AbortHandle) {
        self.handles.push(handle);
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Attach the session index to environment failures. Correctness failures
/// found inside a session keep their own variant.
fn session_error(client: usize, err: HarnessError) -> HarnessError {
    if err.is_correctness_failure() {
        err
    } else {
        HarnessError::ClientSession {
            client,
            reason: err.to_string(),
        }
    }
}

/// The standard append workload.
///
/// With [`KeyPlan::OwnKey`] a session first writes `""` to its key. It then
/// issues `appends_per_client` marker appends, each routed by the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendWorkload {
    plan: KeyPlan,
    appends_per_client: u64,
    n_clients: usize,
}

impl AppendWorkload {
    /// Workload for `n_clients` sessions with one append per session per
    /// client, the default of the standard scenarios.
    pub fn new(n_clients: usize) -> Self {
        Self {
            plan: KeyPlan::default(),
            appends_per_client: n_clients as u64,
            n_clients,
        }
    }

    /// Set the key plan.
    pub fn plan(mut self, plan: KeyPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Set the number of appends each session issues.
    pub fn appends_per_client(mut self, appends: u64) -> Self {
        self.appends_per_client = appends;
        self
    }

    /// Number of appends each session issues.
    pub fn appends(&self) -> u64 {
        self.appends_per_client
    }

    /// Run one session to completion.
    #[instrument(skip_all, fields(client = session.client()))]
    pub async fn run_session<K: KvClient>(
        &self,
        mut session: ClientSession<K>,
    ) -> HarnessResult<ClientSession<K>> {
        let client = session.client();
        if self.plan.session_initializes_key() {
            let key = self.plan.key_for(client, 0, self.n_clients);
            session.put(&key, "").await?;
        }
        for append in 0..self.appends_per_client {
            let key = self.plan.key_for(client, append, self.n_clients);
            session.append_marker(&key).await?;
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::ClusterSpec;

    #[test]
    fn test_key_plans() {
        assert_eq!(KeyPlan::OwnKey.key_for(3, 7, 5), "3");
        assert_eq!(KeyPlan::RoundRobin.key_for(3, 7, 5), "2");
        assert_eq!(KeyPlan::Shared("k".into()).key_for(3, 7, 5), "k");

        assert!(KeyPlan::OwnKey.control_keys(3).is_empty());
        assert_eq!(KeyPlan::RoundRobin.control_keys(3), vec!["0", "1", "2"]);
        assert_eq!(KeyPlan::Shared("k".into()).keys(3), vec!["k"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_record_their_appends() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(5)));
        let ops = Arc::new(OpCounter::new());
        let workload = AppendWorkload::new(3);

        let outcomes = spawn_clients_and_wait(cluster, 3, ops.clone(), move |session| {
            let workload = workload.clone();
            async move { workload.run_session(session).await }
        })
        .await
        .expect("sessions");

        assert_eq!(outcomes.len(), 3);
        for (client, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.client, client);
            assert_eq!(outcome.appends, 3);
            let log = &outcome.logs[&client.to_string()];
            assert_eq!(log.seqs_for(client), vec![0, 1, 2]);
        }
        // one put and three appends per session
        assert_eq!(ops.count(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_session_reports_its_index() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(3)));
        let ops = Arc::new(OpCounter::new());

        let result = spawn_clients_and_wait(cluster, 4, ops, |session| async move {
            if session.client() == 2 {
                return Err(HarnessError::InvalidConfig("boom".into()));
            }
            Ok(session)
        })
        .await;

        match result {
            Err(HarnessError::ClientSession { client, reason }) => {
                assert_eq!(client, 2);
                assert!(reason.contains("boom"));
            }
            other => panic!("expected a session failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_session_reports_its_index() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(3)));
        let ops = Arc::new(OpCounter::new());

        let result = spawn_clients_and_wait(cluster, 2, ops, |session| async move {
            if session.client() == 1 {
                panic!("session exploded");
            }
            Ok(session)
        })
        .await;

        assert!(matches!(
            result,
            Err(HarnessError::ClientSession { client: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_driver_aborts_sessions() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(3)));
        let held = Arc::new(());

        let body_held = held.clone();
        let driver = spawn_clients_and_wait(cluster, 3, Arc::new(OpCounter::new()), move |session| {
            let held = body_held.clone();
            async move {
                let _held = held;
                std::future::pending::<()>().await;
                Ok(session)
            }
        });
        let waited = tokio::time::timeout(Duration::from_secs(1), driver).await;
        assert!(waited.is_err(), "sessions never finish");

        tokio::time::sleep(Duration::from_millis(10)).await;
        // the closure itself was dropped with the driver, only aborted
        // sessions could still hold a clone
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sessions() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterSpec::new(3)));
        let outcomes = spawn_clients_and_wait(cluster, 0, Arc::new(OpCounter::new()), |s| async move {
            Ok(s)
        })
        .await
        .expect("no sessions");
        assert!(outcomes.is_empty());
    }
}
