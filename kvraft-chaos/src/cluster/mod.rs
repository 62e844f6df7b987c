//! Interfaces to the store under test.
//!
//! The harness never looks inside the cluster. It talks to it through two
//! seams:
//!
//! - [`KvClient`]: a clerk bound to a subset of servers, issuing
//!   `get`/`put`/`append`. Calls block (retrying internally) until the
//!   operation is durably resolved, so a client bound only to a minority
//!   partition simply never returns.
//! - [`ClusterController`]: the test fixture that owns the servers and the
//!   simulated network. It builds the cluster, hands out clients, installs
//!   partitions, crashes and restarts servers, and reports log/snapshot sizes.
//!
//! The contract the harness relies on: at-least-once delivery from the
//! transport, exactly-once application by the store, and linearizable per-key
//! history once an operation is acknowledged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;

/// Index of a server in the cluster, `0..servers`.
pub type ServerId = usize;

/// Parameters used to build a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Number of servers.
    pub servers: usize,
    /// Whether the network drops and delays requests and replies.
    pub unreliable: bool,
    /// Raft state size that triggers a snapshot. `None` disables snapshots.
    pub max_raft_state: Option<usize>,
}

impl ClusterSpec {
    /// Reliable cluster without snapshots.
    pub fn new(servers: usize) -> Self {
        Self {
            servers,
            unreliable: false,
            max_raft_state: None,
        }
    }

    /// Set the unreliable-network flag.
    pub fn unreliable(mut self, unreliable: bool) -> Self {
        self.unreliable = unreliable;
        self
    }

    /// Set the snapshot threshold.
    pub fn max_raft_state(mut self, max_raft_state: Option<usize>) -> Self {
        self.max_raft_state = max_raft_state;
        self
    }
}

/// Errors reported by a cluster controller or one of its clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// A server index outside `0..servers` was used.
    #[error("unknown server {0}")]
    UnknownServer(ServerId),

    /// The requested partition is not a split of the server set.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// The client handle was released or never registered.
    #[error("client {0} is not registered with this cluster")]
    UnknownClient(u64),

    /// The cluster was torn down while the operation was outstanding.
    #[error("cluster has been torn down")]
    TornDown,

    /// The cluster could not be built from the given spec.
    #[error("cannot build cluster: {0}")]
    Build(String),

    /// A client operation failed in a way the client could not retry.
    #[error("client operation failed: {0}")]
    Client(String),
}

/// A type alias for `Result<T, ClusterError>`.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// A clerk bound to a set of servers.
///
/// Operations are synchronous from the caller's point of view: they return
/// only once the store has applied them, retrying across leader changes and
/// partitions. A handle is used by one session at a time.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    /// Read the current value of `key` (empty if absent).
    async fn get(&self, key: &str) -> ClusterResult<String>;

    /// Overwrite `key` with `value`.
    async fn put(&self, key: &str, value: &str) -> ClusterResult<()>;

    /// Concatenate `value` to the current value of `key`.
    async fn append(&self, key: &str, value: &str) -> ClusterResult<()>;
}

/// Test fixture controlling the servers and network of the store under test.
#[async_trait]
pub trait ClusterController: Send + Sync + 'static {
    /// Client handle type handed out by this cluster.
    type Client: KvClient + Clone;

    /// Build and start a cluster.
    async fn build(spec: ClusterSpec) -> ClusterResult<Self>
    where
        Self: Sized;

    /// All server indices, in increasing order.
    fn all_servers(&self) -> Vec<ServerId>;

    /// Create a client that can reach exactly `servers`.
    async fn make_client(&self, servers: &[ServerId]) -> ClusterResult<Self::Client>;

    /// Release a client handle. Later operations on clones of it fail.
    async fn release_client(&self, client: Self::Client) -> ClusterResult<()>;

    /// Split the network: traffic flows only within `a` and within `b`.
    async fn partition(&self, a: &[ServerId], b: &[ServerId]) -> ClusterResult<()>;

    /// Heal every partition and reconnect every server.
    async fn connect_all(&self) -> ClusterResult<()>;

    /// Rebind an existing client to `servers`.
    async fn connect_client(&self, client: &Self::Client, servers: &[ServerId])
        -> ClusterResult<()>;

    /// Stop a server. Its persisted state survives.
    async fn shutdown_server(&self, server: ServerId) -> ClusterResult<()>;

    /// Restart a stopped server from its persisted state.
    async fn start_server(&self, server: ServerId) -> ClusterResult<()>;

    /// Largest raft log (persisted state) across servers, in bytes.
    fn log_size(&self) -> usize;

    /// Largest snapshot across servers, in bytes.
    fn snapshot_size(&self) -> usize;

    /// Mark the start of a titled scenario.
    fn begin(&self, title: &str);

    /// Mark the end of the current scenario.
    fn end(&self);

    /// Tear down every server. Outstanding client calls fail.
    async fn cleanup(&self) -> ClusterResult<()>;
}
