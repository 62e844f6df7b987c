//! # kvraft-chaos
//!
//! Fault-injection and correctness harness for replicated, crash-tolerant
//! key-value stores built on a consensus protocol.
//!
//! The harness drives concurrent client sessions against a cluster, reshuffles
//! network partitions while they run, crashes and restarts every server, and
//! then reads the accumulated values back to prove that each client's appends
//! were applied exactly once and in issuance order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                          │
//! │  Init → RunningWorkload → Partitioning → Stopping →         │
//! │         CrashRestart → Verifying → Done                     │
//! ├───────────────┬────────────────────┬────────────────────────┤
//! │  workload     │  partitioner       │  restart               │
//! │  N sessions   │  coin-flip groups  │  stop all, start all   │
//! │  (tasks)      │  (task + token)    │  (inline)              │
//! ├───────────────┴────────────────────┴────────────────────────┤
//! │                  verifier (pure functions)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │        cluster: KvClient + ClusterController traits         │
//! │        (InMemoryCluster reference model included)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store under test is a black box: anything implementing
//! [`ClusterController`] can be exercised. [`InMemoryCluster`] is a small
//! reference model used by the harness's own tests and the `kv_chaos` binary.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kvraft_chaos::{InMemoryCluster, ScenarioConfig, ScenarioRunner};
//!
//! let config = ScenarioConfig::new("3A", 5).partitions(true).crash(true);
//! let report = ScenarioRunner::new(config).run::<InMemoryCluster>().await?;
//! println!("{report}");
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod cluster;
pub mod error;
pub mod partitioner;
pub mod restart;
pub mod scenario;
pub mod scenarios;
pub mod verifier;
pub mod workload;

pub use cluster::memory::{InMemoryClient, InMemoryCluster, ModelOptions};
pub use cluster::{ClusterController, ClusterError, ClusterResult, ClusterSpec, KvClient, ServerId};
pub use error::{HarnessError, HarnessResult};
pub use partitioner::{PartitionAssignment, PartitionInjector, PartitionStats, Partitioner};
pub use restart::crash_and_restart;
pub use scenario::{
    ELECTION_TIMEOUT, STANDARD_SERVERS, ScenarioConfig, ScenarioPhase, ScenarioReport,
    ScenarioRunner, standard_matrix,
};
pub use verifier::{
    AppendLog, AppendViolation, Marker, check_client_appends, check_client_sequence,
    check_concurrent_appends, check_value,
};
pub use workload::{
    AppendWorkload, ClientSession, KeyPlan, OpCounter, SessionOutcome, spawn_clients_and_wait,
};
