//! In-memory reference model of a replicated key-value cluster.
//!
//! [`InMemoryCluster`] is not a consensus implementation. It keeps a single
//! authoritative committed map and models only what the harness can observe
//! from outside a real store:
//!
//! - **Quorum gating**: an operation commits only when the client can reach a
//!   running server that sits in a group holding a strict majority of running,
//!   connected servers. Clients bound to a minority keep retrying.
//! - **Exactly-once application**: each client tags its requests with a
//!   sequence number and the model remembers the last applied request per
//!   client, so retried requests are not applied twice.
//! - **Unreliable network**: when enabled, requests and replies are dropped
//!   and delayed at random (10% / 10% / up to 27ms by default), forcing
//!   retries through the de-duplication path.
//! - **Persistence**: crashed servers keep the committed state.
//! - **Log compaction**: applied operations grow a log counter; once it
//!   reaches `max_raft_state` the log is folded into a snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::{ClusterController, ClusterError, ClusterResult, ClusterSpec, KvClient, ServerId};

/// Fixed per-entry cost added to the log and snapshot size estimates.
const ENTRY_OVERHEAD: usize = 16;

/// Tuning knobs for the reference model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Seed for drop/delay decisions.
    pub seed: u64,
    /// How long a client waits before retrying an unavailable or lost request.
    pub retry_interval: Duration,
    /// Probability that a request is lost before reaching the store.
    pub drop_request_probability: f64,
    /// Probability that a reply is lost after the store applied the request.
    pub drop_reply_probability: f64,
    /// Upper bound of the random delay added to each attempt.
    pub max_delay: Duration,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            retry_interval: Duration::from_millis(100),
            drop_request_probability: 0.1,
            drop_reply_probability: 0.1,
            max_delay: Duration::from_millis(27),
        }
    }
}

impl ModelOptions {
    /// Set the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct ServerState {
    up: bool,
    connected: bool,
    group: usize,
}

impl ServerState {
    fn reachable(&self) -> bool {
        self.up && self.connected
    }
}

#[derive(Debug, Clone)]
enum Op {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
}

impl Op {
    fn log_bytes(&self) -> usize {
        ENTRY_OVERHEAD
            + match self {
                Op::Get { key } => key.len(),
                Op::Put { key, value } | Op::Append { key, value } => key.len() + value.len(),
            }
    }
}

enum Attempt {
    Applied(String),
    Unavailable,
    Dropped,
}

struct ClusterState {
    servers: Vec<ServerState>,
    bindings: HashMap<u64, Vec<ServerId>>,
    next_client: u64,
    store: BTreeMap<String, String>,
    last_applied: HashMap<u64, (u64, String)>,
    log_bytes: usize,
    snapshot_bytes: usize,
    rng: ChaCha8Rng,
    torn_down: bool,
    rpcs: u64,
    applied: u64,
    scenario: Option<ScenarioMark>,
}

struct ScenarioMark {
    title: String,
    started: Instant,
    rpcs: u64,
    applied: u64,
}

impl ClusterState {
    fn new(servers: usize, seed: u64) -> Self {
        Self {
            servers: vec![
                ServerState {
                    up: true,
                    connected: true,
                    group: 0,
                };
                servers
            ],
            bindings: HashMap::new(),
            next_client: 0,
            store: BTreeMap::new(),
            last_applied: HashMap::new(),
            log_bytes: 0,
            snapshot_bytes: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            torn_down: false,
            rpcs: 0,
            applied: 0,
            scenario: None,
        }
    }

    fn check_server(&self, server: ServerId) -> ClusterResult<()> {
        if server < self.servers.len() {
            Ok(())
        } else {
            Err(ClusterError::UnknownServer(server))
        }
    }

    fn check_servers(&self, servers: &[ServerId]) -> ClusterResult<()> {
        servers.iter().try_for_each(|&s| self.check_server(s))
    }

    /// Group holding a strict majority of reachable servers, if any.
    fn quorum_group(&self) -> Option<usize> {
        let majority = self.servers.len() / 2 + 1;
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for server in self.servers.iter().filter(|s| s.reachable()) {
            *counts.entry(server.group).or_default() += 1;
        }
        counts
            .into_iter()
            .find(|&(_, count)| count >= majority)
            .map(|(group, _)| group)
    }

    fn can_commit(&self, binding: &[ServerId]) -> bool {
        let Some(group) = self.quorum_group() else {
            return false;
        };
        binding.iter().any(|&id| {
            self.servers
                .get(id)
                .is_some_and(|s| s.reachable() && s.group == group)
        })
    }

    fn apply(&mut self, client: u64, request: u64, op: &Op, max_raft_state: Option<usize>) -> String {
        if let Some((last, result)) = self.last_applied.get(&client) {
            if *last == request {
                return result.clone();
            }
        }

        let result = match op {
            Op::Get { key } => self.store.get(key).cloned().unwrap_or_default(),
            Op::Put { key, value } => {
                self.store.insert(key.clone(), value.clone());
                String::new()
            }
            Op::Append { key, value } => {
                self.store.entry(key.clone()).or_default().push_str(value);
                String::new()
            }
        };
        self.last_applied.insert(client, (request, result.clone()));
        self.log_bytes += op.log_bytes();
        self.applied += 1;

        if let Some(limit) = max_raft_state {
            if self.log_bytes >= limit {
                self.snapshot_bytes = self.encoded_state_len();
                trace!(
                    log_bytes = self.log_bytes,
                    snapshot_bytes = self.snapshot_bytes,
                    "compacting log into snapshot"
                );
                self.log_bytes = 0;
            }
        }
        result
    }

    fn encoded_state_len(&self) -> usize {
        let store: usize = self
            .store
            .iter()
            .map(|(k, v)| ENTRY_OVERHEAD + k.len() + v.len())
            .sum();
        let dedup: usize = self
            .last_applied
            .values()
            .map(|(_, result)| ENTRY_OVERHEAD + result.len())
            .sum();
        store + dedup
    }

    fn attempt(
        &mut self,
        client: u64,
        request: u64,
        op: &Op,
        spec: &ClusterSpec,
        options: &ModelOptions,
    ) -> ClusterResult<Attempt> {
        if self.torn_down {
            return Err(ClusterError::TornDown);
        }
        let binding = self
            .bindings
            .get(&client)
            .ok_or(ClusterError::UnknownClient(client))?
            .clone();
        self.rpcs += 1;

        if spec.unreliable && self.rng.random_bool(options.drop_request_probability.clamp(0.0, 1.0)) {
            return Ok(Attempt::Dropped);
        }
        if !self.can_commit(&binding) {
            return Ok(Attempt::Unavailable);
        }
        let result = self.apply(client, request, op, spec.max_raft_state);
        if spec.unreliable && self.rng.random_bool(options.drop_reply_probability.clamp(0.0, 1.0)) {
            return Ok(Attempt::Dropped);
        }
        Ok(Attempt::Applied(result))
    }

    fn sample_delay(&mut self, max_delay: Duration) -> Duration {
        let max_ms = max_delay.as_millis() as u64;
        if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.random_range(0..max_ms))
        }
    }
}

struct Shared {
    spec: ClusterSpec,
    options: ModelOptions,
    state: Mutex<ClusterState>,
}

impl Shared {
    async fn execute(&self, client: u64, request: u64, op: Op) -> ClusterResult<String> {
        loop {
            if self.spec.unreliable {
                let delay = { self.state.lock().sample_delay(self.options.max_delay) };
                tokio::time::sleep(delay).await;
            }

            let attempt = {
                let mut state = self.state.lock();
                state.attempt(client, request, &op, &self.spec, &self.options)
            }?;

            match attempt {
                Attempt::Applied(result) => return Ok(result),
                Attempt::Unavailable => {
                    trace!(client, request, "no reachable quorum, retrying");
                }
                Attempt::Dropped => {
                    trace!(client, request, "message lost, retrying");
                }
            }
            tokio::time::sleep(self.options.retry_interval).await;
        }
    }
}

/// Reference model of a replicated key-value cluster.
///
/// See the [module documentation](self) for what is modelled.
pub struct InMemoryCluster {
    shared: Arc<Shared>,
}

impl fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("spec", &self.shared.spec)
            .field("options", &self.shared.options)
            .finish()
    }
}

impl InMemoryCluster {
    /// Create a cluster with default model options.
    pub fn new(spec: ClusterSpec) -> Self {
        Self::with_options(spec, ModelOptions::default())
    }

    /// Create a cluster with explicit model options.
    pub fn with_options(spec: ClusterSpec, options: ModelOptions) -> Self {
        let state = ClusterState::new(spec.servers, options.seed);
        Self {
            shared: Arc::new(Shared {
                spec,
                options,
                state: Mutex::new(state),
            }),
        }
    }

    /// The spec this cluster was built from.
    pub fn spec(&self) -> &ClusterSpec {
        &self.shared.spec
    }

    /// Number of client attempts that reached the model, including retries.
    pub fn rpc_count(&self) -> u64 {
        self.shared.state.lock().rpcs
    }

    /// Number of operations applied to the store (retries excluded).
    pub fn applied_ops(&self) -> u64 {
        self.shared.state.lock().applied
    }

    /// Whether `server` is running.
    pub fn is_up(&self, server: ServerId) -> bool {
        self.shared
            .state
            .lock()
            .servers
            .get(server)
            .is_some_and(|s| s.up)
    }

    /// Whether a majority of servers can currently commit.
    pub fn has_quorum(&self) -> bool {
        self.shared.state.lock().quorum_group().is_some()
    }
}

/// Client handle for [`InMemoryCluster`].
///
/// Clones share the same identity and request sequence; the harness hands a
/// handle to exactly one session.
#[derive(Clone)]
pub struct InMemoryClient {
    id: u64,
    next_request: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryClient").field("id", &self.id).finish()
    }
}

impl InMemoryClient {
    /// Model-assigned identity of this client.
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn submit(&self, op: Op) -> ClusterResult<String> {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.shared.execute(self.id, request, op).await
    }
}

#[async_trait]
impl KvClient for InMemoryClient {
    async fn get(&self, key: &str) -> ClusterResult<String> {
        self.submit(Op::Get {
            key: key.to_string(),
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.submit(Op::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn append(&self, key: &str, value: &str) -> ClusterResult<()> {
        self.submit(Op::Append {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ClusterController for InMemoryCluster {
    type Client = InMemoryClient;

    async fn build(spec: ClusterSpec) -> ClusterResult<Self> {
        if spec.servers == 0 {
            return Err(ClusterError::Build("a cluster needs at least one server".to_string()));
        }
        debug!(
            servers = spec.servers,
            unreliable = spec.unreliable,
            max_raft_state = ?spec.max_raft_state,
            "building in-memory cluster"
        );
        Ok(Self::new(spec))
    }

    fn all_servers(&self) -> Vec<ServerId> {
        (0..self.shared.spec.servers).collect()
    }

    async fn make_client(&self, servers: &[ServerId]) -> ClusterResult<InMemoryClient> {
        let mut state = self.shared.state.lock();
        state.check_servers(servers)?;
        let id = state.next_client;
        state.next_client += 1;
        state.bindings.insert(id, servers.to_vec());
        Ok(InMemoryClient {
            id,
            next_request: Arc::new(AtomicU64::new(0)),
            shared: self.shared.clone(),
        })
    }

    async fn release_client(&self, client: InMemoryClient) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        state
            .bindings
            .remove(&client.id)
            .map(|_| ())
            .ok_or(ClusterError::UnknownClient(client.id))
    }

    async fn partition(&self, a: &[ServerId], b: &[ServerId]) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        state.check_servers(a)?;
        state.check_servers(b)?;

        let mut seen = vec![false; state.servers.len()];
        for &server in a.iter().chain(b) {
            if std::mem::replace(&mut seen[server], true) {
                return Err(ClusterError::InvalidPartition(format!(
                    "server {server} appears more than once"
                )));
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(ClusterError::InvalidPartition(format!(
                "server {missing} is in neither group"
            )));
        }

        for (group, members) in [a, b].into_iter().enumerate() {
            for &server in members {
                let s = &mut state.servers[server];
                s.group = group;
                s.connected = true;
            }
        }
        Ok(())
    }

    async fn connect_all(&self) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        for server in state.servers.iter_mut() {
            server.connected = true;
            server.group = 0;
        }
        Ok(())
    }

    async fn connect_client(
        &self,
        client: &InMemoryClient,
        servers: &[ServerId],
    ) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        state.check_servers(servers)?;
        let binding = state
            .bindings
            .get_mut(&client.id)
            .ok_or(ClusterError::UnknownClient(client.id))?;
        *binding = servers.to_vec();
        Ok(())
    }

    async fn shutdown_server(&self, server: ServerId) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        state.check_server(server)?;
        let s = &mut state.servers[server];
        s.up = false;
        s.connected = false;
        debug!(server, "server shut down");
        Ok(())
    }

    async fn start_server(&self, server: ServerId) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        state.check_server(server)?;
        state.servers[server].up = true;
        debug!(server, "server restarted from persisted state");
        Ok(())
    }

    fn log_size(&self) -> usize {
        self.shared.state.lock().log_bytes
    }

    fn snapshot_size(&self) -> usize {
        self.shared.state.lock().snapshot_bytes
    }

    fn begin(&self, title: &str) {
        let mut state = self.shared.state.lock();
        info!("{} ...", title);
        state.scenario = Some(ScenarioMark {
            title: title.to_string(),
            started: Instant::now(),
            rpcs: state.rpcs,
            applied: state.applied,
        });
    }

    fn end(&self) {
        let mut state = self.shared.state.lock();
        if let Some(mark) = state.scenario.take() {
            info!(
                title = %mark.title,
                elapsed = ?mark.started.elapsed(),
                servers = state.servers.len(),
                rpcs = state.rpcs - mark.rpcs,
                ops = state.applied - mark.applied,
                "  ... Passed"
            );
        }
    }

    async fn cleanup(&self) -> ClusterResult<()> {
        let mut state = self.shared.state.lock();
        state.torn_down = true;
        state.bindings.clear();
        Ok(())
    }
}
