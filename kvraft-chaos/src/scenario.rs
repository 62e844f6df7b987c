//! Scenario configuration and the phased runner.
//!
//! A scenario composes the workload driver, the partition injector and the
//! crash/restart orchestrator, then verifies what the store kept:
//!
//! ```text
//!  Init ──► RunningWorkload ──► [Partitioning] ──► Stopping
//!                                                     │
//!        Done ◄── Verifying ◄── [CrashRestart] ◄──────┘
//! ```
//!
//! | Phase | What happens |
//! |-------|--------------|
//! | `Init` | build the cluster, `begin(title)`, create the control client, initialize shared keys |
//! | `RunningWorkload` | spawn one task per client session |
//! | `Partitioning` | after the grace period, start the partition injector |
//! | `Stopping` | wait for every session (bounded), stop the injector, reconnect, let a leader emerge |
//! | `CrashRestart` | stop every server, wait, restart every server, reconnect |
//! | `Verifying` | read every key back, check the markers, check the log size bound |
//! | `Done` | release the control client, `end()` |
//!
//! The cluster is torn down on every path, including failures.
//!
//! # Synchronization
//!
//! The runner never touches the topology while the injector runs: it waits for
//! the injector's completion signal before reconnecting or crashing anything.
//! A session stuck behind a minority partition is not an error in itself;
//! only the bounded waits (`session_timeout`, `injector_stop_timeout`) turn a
//! stall into a failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::cluster::{ClusterController, ClusterSpec, KvClient};
use crate::error::{HarnessError, HarnessResult};
use crate::partitioner::PartitionInjector;
use crate::restart::crash_and_restart;
use crate::verifier::{
    AppendLog, check_client_appends, check_concurrent_appends, check_value,
};
use crate::workload::{AppendWorkload, KeyPlan, OpCounter, SessionOutcome, spawn_clients_and_wait};

/// Number of servers in the standard scenarios.
pub const STANDARD_SERVERS: usize = 5;

/// Time the store needs to elect a new leader.
pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything that parameterizes one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Label appended to the title, e.g. `"3A"`.
    pub part: String,
    /// Number of servers.
    pub servers: usize,
    /// Number of concurrent client sessions.
    pub clients: usize,
    /// Appends per session; `None` means one per client.
    pub appends_per_client: Option<u64>,
    /// How appends are spread over keys.
    pub key_plan: KeyPlan,
    /// Whether the network drops and delays messages.
    pub unreliable: bool,
    /// Whether every server is crashed and restarted after the workload.
    pub crash: bool,
    /// Whether the partition injector runs alongside the workload.
    pub partitions: bool,
    /// Snapshot threshold; `None` disables snapshots and the log size check.
    pub max_raft_state: Option<usize>,
    /// Leader election timeout of the store.
    pub election_timeout: Duration,
    /// Random extra pause between two partition reshuffles.
    pub partition_jitter: Duration,
    /// Time sessions run undisturbed before the injector starts.
    pub partition_grace: Duration,
    /// Upper bound on the session barrier.
    pub session_timeout: Duration,
    /// Upper bound on the injector's completion signal after stop.
    pub injector_stop_timeout: Duration,
    /// Seed for the partition schedule.
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            part: "3A".to_string(),
            servers: STANDARD_SERVERS,
            clients: 1,
            appends_per_client: None,
            key_plan: KeyPlan::default(),
            unreliable: false,
            crash: false,
            partitions: false,
            max_raft_state: None,
            election_timeout: ELECTION_TIMEOUT,
            partition_jitter: Duration::from_millis(200),
            partition_grace: Duration::from_secs(1),
            session_timeout: Duration::from_secs(120),
            injector_stop_timeout: Duration::from_secs(5),
            seed: 0,
        }
    }
}

impl ScenarioConfig {
    /// Fault-free scenario with `clients` sessions on the standard cluster.
    pub fn new(part: impl Into<String>, clients: usize) -> Self {
        Self {
            part: part.into(),
            clients,
            ..Self::default()
        }
    }

    /// Set the server count.
    pub fn servers(mut self, servers: usize) -> Self {
        self.servers = servers;
        self
    }

    /// Set the number of appends per session.
    pub fn appends_per_client(mut self, appends: u64) -> Self {
        self.appends_per_client = Some(appends);
        self
    }

    /// Set the key plan.
    pub fn key_plan(mut self, plan: KeyPlan) -> Self {
        self.key_plan = plan;
        self
    }

    /// Enable or disable the unreliable network.
    pub fn unreliable(mut self, unreliable: bool) -> Self {
        self.unreliable = unreliable;
        self
    }

    /// Enable or disable the crash/restart phase.
    pub fn crash(mut self, crash: bool) -> Self {
        self.crash = crash;
        self
    }

    /// Enable or disable the partition injector.
    pub fn partitions(mut self, partitions: bool) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the snapshot threshold.
    pub fn max_raft_state(mut self, max_raft_state: Option<usize>) -> Self {
        self.max_raft_state = max_raft_state;
        self
    }

    /// Set the election timeout.
    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Set the bound on the session barrier.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the bound on the injector's stop signal.
    pub fn injector_stop_timeout(mut self, timeout: Duration) -> Self {
        self.injector_stop_timeout = timeout;
        self
    }

    /// Set the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Appends each session issues.
    pub fn appends(&self) -> u64 {
        self.appends_per_client.unwrap_or(self.clients as u64)
    }

    /// Human-readable title, e.g.
    /// `Test: unreliable net, restarts, partitions, snapshots, many clients (3A)`.
    pub fn title(&self) -> String {
        let mut title = String::from("Test: ");
        if self.unreliable {
            title.push_str("unreliable net, ");
        }
        if self.crash {
            title.push_str("restarts, ");
        }
        if self.partitions {
            title.push_str("partitions, ");
        }
        if self.max_raft_state.is_some() {
            title.push_str("snapshots, ");
        }
        if self.clients > 1 {
            title.push_str("many clients");
        } else {
            title.push_str("one client");
        }
        title.push_str(&format!(" ({})", self.part));
        title
    }

    /// Spec the cluster is built from.
    pub fn cluster_spec(&self) -> ClusterSpec {
        ClusterSpec::new(self.servers)
            .unreliable(self.unreliable)
            .max_raft_state(self.max_raft_state)
    }

    /// Reject configurations the runner cannot execute.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.servers == 0 {
            return Err(HarnessError::InvalidConfig("at least one server is required".into()));
        }
        if self.clients == 0 {
            return Err(HarnessError::InvalidConfig("at least one client is required".into()));
        }
        if let KeyPlan::Shared(key) = &self.key_plan {
            if key.is_empty() {
                return Err(HarnessError::InvalidConfig("shared key must not be empty".into()));
            }
        }
        if self.max_raft_state == Some(0) {
            return Err(HarnessError::InvalidConfig(
                "max_raft_state must be positive; use None to disable snapshots".into(),
            ));
        }
        if self.partitions
            && self.injector_stop_timeout <= self.election_timeout + self.partition_jitter
        {
            return Err(HarnessError::InvalidConfig(format!(
                "injector_stop_timeout ({:?}) must exceed one partition interval ({:?})",
                self.injector_stop_timeout,
                self.election_timeout + self.partition_jitter
            )));
        }
        Ok(())
    }
}

/// Phase of a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioPhase {
    /// Cluster built, control client created.
    Init,
    /// Client sessions running.
    RunningWorkload,
    /// Partition injector running alongside the sessions.
    Partitioning,
    /// Waiting for sessions and the injector, healing the network.
    Stopping,
    /// Crashing and restarting every server.
    CrashRestart,
    /// Reading back and checking every key.
    Verifying,
    /// Scenario passed.
    Done,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioPhase::Init => "init",
            ScenarioPhase::RunningWorkload => "running-workload",
            ScenarioPhase::Partitioning => "partitioning",
            ScenarioPhase::Stopping => "stopping",
            ScenarioPhase::CrashRestart => "crash-restart",
            ScenarioPhase::Verifying => "verifying",
            ScenarioPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Summary of a passed scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    /// Scenario title.
    pub title: String,
    /// Time from `begin` to `end`.
    pub elapsed: Duration,
    /// Client operations issued through the harness.
    pub operations: u64,
    /// Partitions installed by the injector.
    pub partitions_installed: u64,
    /// Acknowledged appends per session, by client index.
    pub appends_per_client: Vec<u64>,
    /// Log size reported after verification.
    pub log_size: usize,
    /// Snapshot size reported after verification.
    pub snapshot_size: usize,
    /// Phases the run went through, in order.
    pub phases: Vec<ScenarioPhase>,
}

impl ScenarioReport {
    /// Total acknowledged appends across sessions.
    pub fn total_appends(&self) -> u64 {
        self.appends_per_client.iter().sum()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Scenario Report ===")?;
        writeln!(f, "{}", self.title)?;
        writeln!(f, "Elapsed: {:?}", self.elapsed)?;
        writeln!(f, "Operations: {}", self.operations)?;
        writeln!(f, "Appends: {} {:?}", self.total_appends(), self.appends_per_client)?;
        writeln!(f, "Partitions Installed: {}", self.partitions_installed)?;
        writeln!(f, "Log Size: {}", self.log_size)?;
        writeln!(f, "Snapshot Size: {}", self.snapshot_size)?;

        let phases: Vec<String> = self.phases.iter().map(ToString::to_string).collect();
        writeln!(f, "Phases: {}", phases.join(" → "))
    }
}

/// Runs one [`ScenarioConfig`] against a cluster.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    config: ScenarioConfig,
}

impl ScenarioRunner {
    /// Runner for `config`.
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    /// The configuration this runner executes.
    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Build a fresh cluster of type `C` and run the scenario on it.
    pub async fn run<C: ClusterController>(&self) -> HarnessResult<ScenarioReport> {
        self.config.validate()?;
        let cluster = C::build(self.config.cluster_spec()).await?;
        self.run_with(Arc::new(cluster)).await
    }

    /// Run the scenario on an already built cluster. The cluster is torn
    /// down afterwards, whatever the outcome.
    #[instrument(skip_all, fields(seed = self.config.seed))]
    pub async fn run_with<C: ClusterController>(
        &self,
        cluster: Arc<C>,
    ) -> HarnessResult<ScenarioReport> {
        self.config.validate()?;
        let title = self.config.title();
        cluster.begin(&title);

        let result = self.execute(&cluster, title).await;
        let teardown = cluster.cleanup().await;

        match result {
            Ok(report) => {
                teardown?;
                Ok(report)
            }
            Err(err) => {
                error!(error = %err, "scenario failed");
                Err(err)
            }
        }
    }

    async fn execute<C: ClusterController>(
        &self,
        cluster: &Arc<C>,
        title: String,
    ) -> HarnessResult<ScenarioReport> {
        let config = &self.config;
        let started = Instant::now();
        let mut phases = Vec::new();
        let ops = Arc::new(OpCounter::new());

        enter(&mut phases, ScenarioPhase::Init);
        let control = cluster.make_client(&cluster.all_servers()).await?;
        for key in config.key_plan.control_keys(config.clients) {
            ops.record();
            control.put(&key, "").await?;
        }

        enter(&mut phases, ScenarioPhase::RunningWorkload);
        let workload = AppendWorkload::new(config.clients)
            .plan(config.key_plan.clone())
            .appends_per_client(config.appends());
        let mut sessions = tokio::spawn(spawn_clients_and_wait(
            cluster.clone(),
            config.clients,
            ops.clone(),
            move |session| {
                let workload = workload.clone();
                async move { workload.run_session(session).await }
            },
        ));

        let partitioner = if config.partitions {
            tokio::time::sleep(config.partition_grace).await;
            enter(&mut phases, ScenarioPhase::Partitioning);
            let injector =
                PartitionInjector::new(config.election_timeout, config.partition_jitter, config.seed);
            Some(injector.spawn(cluster.clone()))
        } else {
            None
        };

        enter(&mut phases, ScenarioPhase::Stopping);
        let outcomes = match tokio::time::timeout(config.session_timeout, &mut sessions).await {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(join_err)) => Err(HarnessError::TaskFailed {
                task: "client driver".to_string(),
                reason: join_err.to_string(),
            }),
            Err(_) => {
                sessions.abort();
                Err(HarnessError::Timeout {
                    what: "client sessions".to_string(),
                    waited: config.session_timeout,
                })
            }
        };
        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(err) => {
                // the session failure is the one reported
                if let Some(partitioner) = partitioner {
                    if let Err(stop_err) = partitioner.stop(config.injector_stop_timeout).await {
                        warn!(error = %stop_err, "partition injector did not stop cleanly");
                    }
                }
                return Err(err);
            }
        };

        let mut partitions_installed = 0;
        if let Some(partitioner) = partitioner {
            let stats = partitioner.stop(config.injector_stop_timeout).await?;
            partitions_installed = stats.partitions_installed;
            cluster.connect_all().await?;
            // a request sent into a minority only returns once a new term starts
            tokio::time::sleep(config.election_timeout).await;
        }

        if config.crash {
            enter(&mut phases, ScenarioPhase::CrashRestart);
            crash_and_restart(cluster.as_ref(), config.election_timeout).await?;
        }

        enter(&mut phases, ScenarioPhase::Verifying);
        self.verify(&control, &ops, &outcomes).await?;
        if let Some(threshold) = config.max_raft_state {
            let log_size = cluster.log_size();
            if log_size > 2 * threshold {
                return Err(HarnessError::BoundViolation {
                    what: "raft log",
                    actual: log_size,
                    limit: 2 * threshold,
                });
            }
        }

        cluster.release_client(control).await?;
        enter(&mut phases, ScenarioPhase::Done);
        cluster.end();

        Ok(ScenarioReport {
            title,
            elapsed: started.elapsed(),
            operations: ops.count(),
            partitions_installed,
            appends_per_client: outcomes.iter().map(|o| o.appends).collect(),
            log_size: cluster.log_size(),
            snapshot_size: cluster.snapshot_size(),
            phases,
        })
    }

    async fn verify<K: KvClient>(
        &self,
        control: &K,
        ops: &OpCounter,
        outcomes: &[SessionOutcome],
    ) -> HarnessResult<()> {
        let plan = &self.config.key_plan;
        let counts: Vec<u64> = outcomes.iter().map(|o| o.appends).collect();

        for (index, key) in plan.keys(self.config.clients).into_iter().enumerate() {
            ops.record();
            let value = control.get(&key).await?;

            let mut merged = AppendLog::new();
            for outcome in outcomes {
                if let Some(log) = outcome.logs.get(&key) {
                    merged.merge(log);
                }
            }

            match plan {
                KeyPlan::OwnKey => {
                    check_client_appends(index, &value, counts.get(index).copied().unwrap_or(0))?;
                    check_value(&key, &merged.expected_value(), &value)?;
                }
                KeyPlan::RoundRobin => merged.verify(&value)?,
                KeyPlan::Shared(_) => check_concurrent_appends(&value, &counts)?,
            }
            info!(key = %key, appends = merged.len(), "key verified");
        }
        Ok(())
    }
}

fn enter(phases: &mut Vec<ScenarioPhase>, phase: ScenarioPhase) {
    info!(phase = %phase, "scenario phase");
    phases.push(phase);
}

/// The generic scenarios of the standard suite, in the order they are
/// usually run.
pub fn standard_matrix() -> Vec<ScenarioConfig> {
    // (part, clients, unreliable, crash, partitions, max_raft_state)
    let rows: [(&str, usize, bool, bool, bool, Option<usize>); 14] = [
        ("3A", 2, false, false, false, None),
        ("3A", 5, true, false, false, None),
        ("3A", 1, false, false, true, None),
        ("3A", 5, false, false, true, None),
        ("3A", 1, false, true, false, None),
        ("3A", 5, false, true, false, None),
        ("3A", 5, true, true, false, None),
        ("3A", 5, false, true, true, None),
        ("3A", 5, true, true, true, None),
        ("3B", 1, false, true, false, Some(1000)),
        ("3B", 20, false, true, false, Some(1000)),
        ("3B", 5, true, false, false, Some(1000)),
        ("3B", 5, true, true, false, Some(1000)),
        ("3B", 5, true, true, true, Some(1000)),
    ];

    rows.into_iter()
        .enumerate()
        .map(|(seed, (part, clients, unreliable, crash, partitions, max_raft_state))| {
            ScenarioConfig::new(part, clients)
                .unreliable(unreliable)
                .crash(crash)
                .partitions(partitions)
                .max_raft_state(max_raft_state)
                .seed(seed as u64)
        })
        .collect()
}
