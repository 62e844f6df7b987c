//! Randomized partition injector.
//!
//! While client sessions run, the injector keeps reshuffling the network:
//!
//! ```text
//! loop {
//!     stop requested? ──yes──► signal completion, exit
//!         │ no
//!     coin flip per server → group A / group B
//!     cluster.partition(A, B)
//!     sleep(election_timeout + U[0, jitter))
//! }
//! ```
//!
//! Groups can be arbitrarily unbalanced, including every server on one side.
//! The stop request is polled once per iteration and never interrupts a
//! sleep, so stopping takes up to one sleep interval. Completion is signalled
//! exactly once, over a one-shot channel owned by the [`Partitioner`] handle.

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{ClusterController, ClusterResult, ServerId};
use crate::error::{HarnessError, HarnessResult};

/// A split of the servers into two disjoint groups covering all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    /// First group.
    pub group_a: Vec<ServerId>,
    /// Second group.
    pub group_b: Vec<ServerId>,
}

impl PartitionAssignment {
    /// Assign each server to a group by an independent fair coin flip.
    pub fn random<R: Rng + ?Sized>(servers: &[ServerId], rng: &mut R) -> Self {
        let mut group_a = Vec::new();
        let mut group_b = Vec::new();
        for &server in servers {
            if rng.random_bool(0.5) {
                group_b.push(server);
            } else {
                group_a.push(server);
            }
        }
        Self { group_a, group_b }
    }

    /// Put the first `k` servers in group A and the rest in group B.
    pub fn split(servers: &[ServerId], k: usize) -> Self {
        let k = k.min(servers.len());
        Self {
            group_a: servers[..k].to_vec(),
            group_b: servers[k..].to_vec(),
        }
    }

    /// Whether every server landed on the same side.
    pub fn is_degenerate(&self) -> bool {
        self.group_a.is_empty() || self.group_b.is_empty()
    }
}

/// Counters reported by the injector when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Number of partitions installed.
    pub partitions_installed: u64,
}

/// Background task reshuffling partitions until cancelled.
#[derive(Debug, Clone)]
pub struct PartitionInjector {
    election_timeout: Duration,
    jitter: Duration,
    rng: ChaCha8Rng,
}

impl PartitionInjector {
    /// Injector sleeping `election_timeout + U[0, jitter)` between
    /// reshuffles, seeded for a reproducible partition schedule.
    pub fn new(election_timeout: Duration, jitter: Duration, seed: u64) -> Self {
        Self {
            election_timeout,
            jitter,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Draw the next assignment.
    pub fn next_assignment(&mut self, servers: &[ServerId]) -> PartitionAssignment {
        PartitionAssignment::random(servers, &mut self.rng)
    }

    /// Draw the next pause between reshuffles.
    pub fn next_pause(&mut self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.election_timeout;
        }
        self.election_timeout + Duration::from_millis(self.rng.random_range(0..jitter_ms))
    }

    /// Run the reshuffle loop on the current task until `shutdown` is
    /// cancelled. A failure to install a partition ends the loop.
    pub async fn run<C: ClusterController>(
        &mut self,
        cluster: &C,
        shutdown: &CancellationToken,
    ) -> ClusterResult<PartitionStats> {
        let servers = cluster.all_servers();
        let mut stats = PartitionStats::default();

        while !shutdown.is_cancelled() {
            let assignment = self.next_assignment(&servers);
            cluster
                .partition(&assignment.group_a, &assignment.group_b)
                .await?;
            stats.partitions_installed += 1;
            debug!(
                group_a = ?assignment.group_a,
                group_b = ?assignment.group_b,
                "partition installed"
            );
            tokio::time::sleep(self.next_pause()).await;
        }

        info!(
            partitions = stats.partitions_installed,
            "partition injector stopped"
        );
        Ok(stats)
    }

    /// Start the loop on its own task.
    pub fn spawn<C: ClusterController>(mut self, cluster: Arc<C>) -> Partitioner {
        let shutdown = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let token = shutdown.clone();
        tokio::spawn(async move {
            let result = self.run(cluster.as_ref(), &token).await;
            // the receiver may be gone if the runner bailed out
            let _ = done_tx.send(result);
        });

        Partitioner {
            shutdown,
            done: done_rx,
        }
    }
}

/// Handle on a running [`PartitionInjector`].
#[derive(Debug)]
pub struct Partitioner {
    shutdown: CancellationToken,
    done: oneshot::Receiver<ClusterResult<PartitionStats>>,
}

impl Partitioner {
    /// Ask the injector to stop and wait up to `wait` for its completion
    /// signal.
    pub async fn stop(self, wait: Duration) -> HarnessResult<PartitionStats> {
        self.shutdown.cancel();
        match tokio::time::timeout(wait, self.done).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(HarnessError::TaskFailed {
                task: "partition injector".to_string(),
                reason: "exited without signalling completion".to_string(),
            }),
            Err(_) => Err(HarnessError::Timeout {
                what: "partition injector to stop".to_string(),
                waited: wait,
            }),
        }
    }
}
