//! Error types for the harness.
//!
//! Failures fall in two families:
//!
//! | Error | Family | When it happens |
//! |-------|--------|-----------------|
//! | `Assertion` | correctness | A marker is missing, duplicated, misordered, or a read mismatched |
//! | `BoundViolation` | correctness | Log or snapshot size exceeds its bound |
//! | `UnexpectedProgress` | correctness | An operation completed inside a minority partition |
//! | `ClientSession` | environment | A session's workload failed, with its client index |
//! | `Timeout` | environment | A barrier or completion signal did not arrive in time |
//! | `TaskFailed` | environment | A spawned harness task panicked or was dropped |
//! | `InvalidConfig` | setup | The scenario cannot run on the given cluster |
//! | `Cluster` | environment | The cluster controller or a client reported an error |
//!
//! Correctness failures are never retried: the store violated an invariant.

use std::time::Duration;

use crate::cluster::ClusterError;
use crate::verifier::AppendViolation;

/// Errors raised while running a scenario.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The verifier found a missing, duplicate or misordered marker, or a
    /// read returned something other than the expected value.
    #[error("append check failed: {0}")]
    Assertion(#[from] AppendViolation),

    /// A size reported by the cluster exceeds its configured bound.
    #[error("{what} exceeds its bound ({actual} > {limit})")]
    BoundViolation {
        /// What was measured (e.g. "raft log").
        what: &'static str,
        /// Reported size in bytes.
        actual: usize,
        /// Maximum allowed size in bytes.
        limit: usize,
    },

    /// A client session failed before completing its workload.
    #[error("client session {client} failed: {reason}")]
    ClientSession {
        /// Index of the failing session.
        client: usize,
        /// What went wrong.
        reason: String,
    },

    /// A bounded wait expired.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What the harness was waiting for.
        what: String,
        /// How long it waited.
        waited: Duration,
    },

    /// An operation completed in a window where it must stay blocked.
    #[error("{what} completed while it should have been blocked")]
    UnexpectedProgress {
        /// The operation that made progress.
        what: String,
    },

    /// A spawned harness task ended without reporting a result.
    #[error("{task} task failed: {reason}")]
    TaskFailed {
        /// Name of the task.
        task: String,
        /// Panic message or cancellation reason.
        reason: String,
    },

    /// The scenario cannot run with the given configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The cluster controller or a client failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl HarnessError {
    /// Whether this error means the store under test violated an invariant,
    /// as opposed to a failure of the environment or the harness itself.
    pub fn is_correctness_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::Assertion(_)
                | HarnessError::BoundViolation { .. }
                | HarnessError::UnexpectedProgress { .. }
        )
    }
}

/// A type alias for `Result<T, HarnessError>`.
pub type HarnessResult<T> = Result<T, HarnessError>;
