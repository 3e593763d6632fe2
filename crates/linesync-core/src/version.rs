//! Operation identifiers and causal version tracking.
//!
//! Every operation is identified by the peer that authored it and a dense,
//! per-peer counter. On top of that the log keeps:
//! - a Lamport stamp per operation for deterministic ordering of concurrent ops
//! - a [`VersionVector`] summarising how many ops of each peer are known
//! - a [`Frontier`] naming the causal heads of the log

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Identifier of a replica (one editing session).
pub type PeerId = Uuid;

/// Globally unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    /// Authoring peer
    pub peer: PeerId,
    /// Dense per-peer sequence number, starting at 0
    pub counter: u32,
}

impl OpId {
    /// Create a new operation identifier.
    #[must_use]
    pub fn new(peer: PeerId, counter: u32) -> Self {
        Self { peer, counter }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, short_peer(&self.peer))
    }
}

/// Lamport stamp with peer tiebreaker.
///
/// Total order used for last-writer-wins fields and sibling ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Lamport clock value
    pub lamport: u64,
    /// Peer for deterministic tiebreaking
    pub peer: PeerId,
}

impl Stamp {
    /// Create a new stamp.
    #[must_use]
    pub fn new(lamport: u64, peer: PeerId) -> Self {
        Self { lamport, peer }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.lamport.cmp(&other.lamport) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.peer.cmp(&other.peer)
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-peer count of known operations.
///
/// `get(peer) == n` means ops `0..n` of that peer are included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<PeerId, u32>);

impl VersionVector {
    /// Create an empty version vector (genesis).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known ops for a peer.
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> u32 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// Whether the given op is covered by this version.
    #[must_use]
    pub fn includes(&self, id: &OpId) -> bool {
        id.counter < self.get(&id.peer)
    }

    /// Raise the count for `peer` to at least `end`.
    pub fn advance(&mut self, peer: PeerId, end: u32) {
        let entry = self.0.entry(peer).or_insert(0);
        if end > *entry {
            *entry = end;
        }
    }

    /// Whether every op known to `other` is also known here.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        other.0.iter().all(|(peer, &n)| self.get(peer) >= n)
    }

    /// Total number of ops across all peers.
    #[must_use]
    pub fn total_ops(&self) -> u64 {
        self.0.values().map(|&n| u64::from(n)).sum()
    }

    /// Iterate over `(peer, count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &u32)> {
        self.0.iter()
    }

    /// Whether no op is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&n| n == 0)
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (peer, count) in &self.0 {
            write!(f, "{}:{count} ", short_peer(peer))?;
        }
        Ok(())
    }
}

/// The causal heads of an operation history.
///
/// Frontiers are produced by the document; outside of it they are only
/// stored and compared for equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frontier(BTreeSet<OpId>);

impl Frontier {
    /// The empty frontier, denoting genesis.
    #[must_use]
    pub fn genesis() -> Self {
        Self::default()
    }

    /// Whether this is the genesis frontier.
    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over head operation ids.
    pub fn iter(&self) -> impl Iterator<Item = &OpId> {
        self.0.iter()
    }

    /// Number of heads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frontier has no heads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace the heads superseded by a newly appended run of ops.
    ///
    /// `deps` are the run's declared dependencies and `last` its final op.
    pub(crate) fn advance(&mut self, deps: &Frontier, last: OpId) {
        for dep in deps.iter() {
            self.0.remove(dep);
        }
        self.0
            .retain(|id| !(id.peer == last.peer && id.counter < last.counter));
        self.0.insert(last);
    }
}

impl FromIterator<OpId> for Frontier {
    fn from_iter<I: IntoIterator<Item = OpId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// First four characters of a peer id, for compact display.
#[must_use]
pub fn short_peer(peer: &PeerId) -> String {
    peer.simple().to_string().chars().take(4).collect()
}
