//! Append-order verification.
//!
//! Every append issued by a session carries a unique marker `x {client} {seq} y`
//! where `seq` counts that client's appends from zero. After the run the final
//! value of a key is the concatenation of every applied marker, interleaved
//! across clients in commit order. Three properties are checked per client:
//!
//! | Property | Violation |
//! |----------|-----------|
//! | every issued marker occurs | [`AppendViolation::Missing`] |
//! | every marker occurs exactly once | [`AppendViolation::Duplicate`] |
//! | markers occur in issuance order | [`AppendViolation::Misordered`] |
//!
//! Markers are delimited by the trailing ` y`, so `x 1 1 y` never matches
//! inside `x 1 10 y`. All functions here are pure; the first violation found
//! is returned.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique tag for one append, rendered as `x {client} {seq} y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Marker {
    /// Client index of the issuing session.
    pub client: usize,
    /// Per-client append counter, starting at 0.
    pub seq: u64,
}

impl Marker {
    /// Create a marker.
    pub fn new(client: usize, seq: u64) -> Self {
        Self { client, seq }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x {} {} y", self.client, self.seq)
    }
}

/// A violated append invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendViolation {
    /// An issued marker does not occur in the value.
    #[error("missing element {marker} in Append result {value}")]
    Missing {
        /// The marker that was expected.
        marker: Marker,
        /// The value that was checked.
        value: String,
    },

    /// A marker occurs more than once.
    #[error("duplicate element {marker} in Append result (offsets {first} and {last})")]
    Duplicate {
        /// The duplicated marker.
        marker: Marker,
        /// Offset of the first occurrence.
        first: usize,
        /// Offset of the last occurrence.
        last: usize,
    },

    /// A marker occurs before one issued earlier by the same client.
    #[error("wrong order for element {marker} in Append result (offset {offset} <= {previous})")]
    Misordered {
        /// The out-of-order marker.
        marker: Marker,
        /// Its offset in the value.
        offset: usize,
        /// Offset of the previous marker of the same client.
        previous: usize,
    },

    /// A read returned a different value than the one recorded.
    #[error("get({key}): expected {expected:?}, got {actual:?}")]
    ValueMismatch {
        /// Key that was read.
        key: String,
        /// Value the harness recorded.
        expected: String,
        /// Value the store returned.
        actual: String,
    },
}

/// Check that `client`'s markers with sequence numbers `seqs` each occur
/// exactly once in `value`, at strictly increasing offsets.
///
/// `seqs` must be given in issuance order.
pub fn check_client_sequence(
    client: usize,
    value: &str,
    seqs: impl IntoIterator<Item = u64>,
) -> Result<(), AppendViolation> {
    let mut previous: Option<usize> = None;
    for seq in seqs {
        let marker = Marker::new(client, seq);
        let needle = marker.to_string();
        let Some(offset) = value.find(&needle) else {
            return Err(AppendViolation::Missing {
                marker,
                value: value.to_string(),
            });
        };
        if let Some(last) = value.rfind(&needle).filter(|&last| last != offset) {
            return Err(AppendViolation::Duplicate {
                marker,
                first: offset,
                last,
            });
        }
        if let Some(previous) = previous.filter(|&previous| offset <= previous) {
            return Err(AppendViolation::Misordered {
                marker,
                offset,
                previous,
            });
        }
        previous = Some(offset);
    }
    Ok(())
}

/// Check that `client`'s markers `0..count` each occur exactly once in
/// `value`, in increasing order.
pub fn check_client_appends(client: usize, value: &str, count: u64) -> Result<(), AppendViolation> {
    check_client_sequence(client, value, 0..count)
}

/// Run [`check_client_appends`] for every client, where `counts[i]` is the
/// number of appends client `i` issued.
pub fn check_concurrent_appends(value: &str, counts: &[u64]) -> Result<(), AppendViolation> {
    counts
        .iter()
        .enumerate()
        .try_for_each(|(client, &count)| check_client_appends(client, value, count))
}

/// Compare a read against the value the harness recorded.
pub fn check_value(key: &str, expected: &str, actual: &str) -> Result<(), AppendViolation> {
    if expected == actual {
        Ok(())
    } else {
        Err(AppendViolation::ValueMismatch {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Markers appended to one key, in the order they were acknowledged.
///
/// A session keeps one log per key it appends to. Logs from several sessions
/// can be merged to check a shared key: the merged log no longer predicts the
/// exact value, but [`AppendLog::verify`] only relies on per-client order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendLog {
    entries: Vec<Marker>,
}

impl AppendLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledged append.
    pub fn record(&mut self, marker: Marker) {
        self.entries.push(marker);
    }

    /// Number of recorded appends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded markers in acknowledgement order.
    pub fn markers(&self) -> &[Marker] {
        &self.entries
    }

    /// Concatenation of the recorded markers.
    ///
    /// This is the exact expected value of a key only when a single session
    /// appended to it.
    pub fn expected_value(&self) -> String {
        self.entries.iter().map(Marker::to_string).collect()
    }

    /// Sequence numbers recorded for `client`, in order.
    pub fn seqs_for(&self, client: usize) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|m| m.client == client)
            .map(|m| m.seq)
            .collect()
    }

    /// Distinct clients present in the log, ascending.
    pub fn clients(&self) -> Vec<usize> {
        let mut clients: Vec<usize> = self.entries.iter().map(|m| m.client).collect();
        clients.sort_unstable();
        clients.dedup();
        clients
    }

    /// Append another log's entries after this one's.
    pub fn merge(&mut self, other: &AppendLog) {
        self.entries.extend_from_slice(&other.entries);
    }

    /// Check every client's recorded markers against `value`.
    pub fn verify(&self, value: &str) -> Result<(), AppendViolation> {
        let mut per_client: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for marker in &self.entries {
            per_client.entry(marker.client).or_default().push(marker.seq);
        }
        per_client
            .into_iter()
            .try_for_each(|(client, seqs)| check_client_sequence(client, value, seqs))
    }
}
