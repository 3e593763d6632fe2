//! Operation log: changes, delta encoding and causal bookkeeping.
//!
//! The log is the single source of truth of a document. It stores every
//! integrated [`Change`] in an order that respects causality, which makes it
//! possible to:
//! - export the ops a remote version is missing
//! - import changes delivered in any order (not-yet-ready changes wait in a
//!   pending buffer)
//! - compute the causal closure of a [`Frontier`] for checkouts

use crate::document::DocError;
use crate::state::Value;
use crate::version::{Frontier, OpId, PeerId, VersionVector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Current encoding format of exported updates.
pub const UPDATE_FORMAT: u8 = 1;

/// A single operation inside a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    /// Per-peer counter of this op
    pub counter: u32,
    /// Lamport clock value of this op
    pub lamport: u64,
    /// What the op does
    pub content: OpContent,
}

/// Operation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpContent {
    /// Insert a new record after `parent` (`None` = list head)
    Insert {
        /// Collection name
        container: String,
        /// Left origin of the new record
        parent: Option<OpId>,
    },
    /// Tombstone a record
    Delete {
        /// Collection name
        container: String,
        /// Record to delete
        target: OpId,
    },
    /// Write a record field
    Set {
        /// Collection name
        container: String,
        /// Record to update
        target: OpId,
        /// Field name
        field: String,
        /// New value
        value: Value,
    },
}

/// An atomic run of ops committed by one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Authoring peer
    pub peer: PeerId,
    /// Causal heads observed when the change was committed
    pub deps: Frontier,
    /// Ops with contiguous counters
    pub ops: Vec<Op>,
}

impl Change {
    /// Counter of the first op.
    #[must_use]
    pub fn start(&self) -> u32 {
        self.ops.first().map_or(0, |op| op.counter)
    }

    /// Counter one past the last op.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.ops.last().map_or(0, |op| op.counter.saturating_add(1))
    }

    /// Id of the last op.
    #[must_use]
    pub fn last_id(&self) -> Option<OpId> {
        self.ops.last().map(|op| OpId::new(self.peer, op.counter))
    }

    /// The suffix of this change starting at `counter`.
    #[must_use]
    pub fn slice_from(&self, counter: u32) -> Self {
        Self {
            peer: self.peer,
            deps: self.deps.clone(),
            ops: self
                .ops
                .iter()
                .filter(|op| op.counter >= counter)
                .cloned()
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        let Some(first) = self.ops.first() else {
            return Err(format!("empty change from peer {}", self.peer));
        };
        for (offset, op) in self.ops.iter().enumerate() {
            let expected = u32::try_from(offset)
                .ok()
                .and_then(|offset| first.counter.checked_add(offset));
            if expected != Some(op.counter) {
                return Err(format!(
                    "non-contiguous counter {} in change from peer {}",
                    op.counter, self.peer
                ));
            }
        }
        Ok(())
    }
}

/// Wire envelope of exported updates.
#[derive(Debug, Serialize, Deserialize)]
struct EncodedUpdates {
    format: u8,
    changes: Vec<Change>,
}

/// Encode changes as a delta payload.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_changes(changes: Vec<Change>) -> Result<Vec<u8>, DocError> {
    let envelope = EncodedUpdates {
        format: UPDATE_FORMAT,
        changes,
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes).map_err(|e| DocError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode and validate a delta payload.
///
/// # Errors
///
/// Returns [`DocError::MalformedDelta`] if the bytes are not a valid payload.
pub fn decode_changes(bytes: &[u8]) -> Result<Vec<Change>, DocError> {
    let envelope: EncodedUpdates =
        ciborium::from_reader(bytes).map_err(|e| DocError::MalformedDelta(e.to_string()))?;
    if envelope.format != UPDATE_FORMAT {
        return Err(DocError::MalformedDelta(format!(
            "unsupported update format {}",
            envelope.format
        )));
    }
    for change in &envelope.changes {
        change.validate().map_err(DocError::MalformedDelta)?;
    }
    Ok(envelope.changes)
}

/// Causally ordered log of integrated changes.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    changes: Vec<Change>,
    /// Per peer: `(start, end, index into changes)`, ascending
    by_peer: HashMap<PeerId, Vec<(u32, u32, usize)>>,
    version: VersionVector,
    frontier: Frontier,
    next_lamport: u64,
    pending: Vec<Change>,
}

impl OpLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Version vector of everything integrated.
    #[must_use]
    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Causal heads of everything integrated.
    #[must_use]
    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    /// Lamport value for the next local op.
    #[must_use]
    pub fn next_lamport(&self) -> u64 {
        self.next_lamport
    }

    /// Number of integrated changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing has been integrated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of received changes still waiting for their dependencies.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether all ops of `frontier` are integrated.
    #[must_use]
    pub fn contains_frontier(&self, frontier: &Frontier) -> bool {
        frontier.iter().all(|id| self.version.includes(id))
    }

    fn is_ready(&self, change: &Change) -> bool {
        self.version.get(&change.peer) >= change.start()
            && change.deps.iter().all(|dep| self.version.includes(dep))
    }

    /// Append a change whose dependencies are integrated.
    ///
    /// Ops already known are dropped; returns the newly integrated part.
    pub(crate) fn append(&mut self, change: &Change) -> Option<Change> {
        let known = self.version.get(&change.peer);
        if change.end() <= known {
            return None;
        }
        let fresh = if change.start() < known {
            change.slice_from(known)
        } else {
            change.clone()
        };
        let last = fresh.last_id()?;
        let max_lamport = fresh.ops.iter().map(|op| op.lamport).max().unwrap_or(0);

        self.by_peer.entry(fresh.peer).or_default().push((
            fresh.start(),
            fresh.end(),
            self.changes.len(),
        ));
        self.version.advance(fresh.peer, fresh.end());
        self.frontier.advance(&fresh.deps, last);
        self.next_lamport = self.next_lamport.max(max_lamport.saturating_add(1));
        self.changes.push(fresh.clone());
        Some(fresh)
    }

    /// Queue a received change unless it is known or already queued.
    fn buffer(&mut self, change: Change) {
        if change.end() <= self.version.get(&change.peer) {
            return;
        }
        let queued = self.pending.iter().any(|p| {
            p.peer == change.peer && p.start() <= change.start() && change.end() <= p.end()
        });
        if queued {
            tracing::trace!(peer = %change.peer, start = change.start(), "Dropped redelivered change");
            return;
        }
        self.pending.push(change);
    }

    /// Integrate received changes in any order.
    ///
    /// Changes with missing dependencies are buffered and retried on later
    /// imports. Returns the newly integrated parts in integration order.
    pub(crate) fn import(&mut self, changes: Vec<Change>) -> Vec<Change> {
        for change in changes {
            self.buffer(change);
        }
        let mut integrated = Vec::new();
        loop {
            let mut progressed = false;
            let mut waiting = Vec::new();
            for change in std::mem::take(&mut self.pending) {
                if change.end() <= self.version.get(&change.peer) {
                    continue;
                }
                if self.is_ready(&change) {
                    if let Some(fresh) = self.append(&change) {
                        integrated.push(fresh);
                    }
                    progressed = true;
                } else {
                    waiting.push(change);
                }
            }
            self.pending = waiting;
            if !progressed {
                break;
            }
        }
        integrated
    }

    /// Changes (or suffixes of changes) not covered by `since`.
    ///
    /// `None` exports the whole log.
    #[must_use]
    pub fn changes_since(&self, since: Option<&VersionVector>) -> Vec<Change> {
        self.changes
            .iter()
            .filter_map(|change| {
                let known = since.map_or(0, |vv| vv.get(&change.peer));
                if change.end() <= known {
                    None
                } else if change.start() < known {
                    Some(change.slice_from(known))
                } else {
                    Some(change.clone())
                }
            })
            .collect()
    }

    fn locate(&self, id: &OpId) -> Option<usize> {
        let runs = self.by_peer.get(&id.peer)?;
        let pos = runs.partition_point(|(start, _, _)| *start <= id.counter);
        let (_, end, index) = *runs.get(pos.checked_sub(1)?)?;
        (id.counter < end).then_some(index)
    }

    /// Version vector of the causal closure of `frontier`.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::UnknownFrontier`] if the frontier names ops that
    /// have not been integrated.
    pub fn closure(&self, frontier: &Frontier) -> Result<VersionVector, DocError> {
        let mut result = VersionVector::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<OpId> = frontier.iter().copied().collect();
        while let Some(id) = stack.pop() {
            let index = self.locate(&id).ok_or(DocError::UnknownFrontier)?;
            result.advance(id.peer, id.counter.saturating_add(1));
            if !visited.insert(index) {
                continue;
            }
            let change = &self.changes[index];
            stack.extend(change.deps.iter().copied());
            if let Some(previous) = change.start().checked_sub(1) {
                stack.push(OpId::new(change.peer, previous));
            }
        }
        Ok(result)
    }

    /// Integrated ops covered by `version`, in causal order.
    pub fn ops_within<'a>(
        &'a self,
        version: &'a VersionVector,
    ) -> impl Iterator<Item = (PeerId, &'a Op)> + 'a {
        self.changes.iter().flat_map(move |change| {
            change
                .ops
                .iter()
                .filter(move |op| op.counter < version.get(&change.peer))
                .map(move |op| (change.peer, op))
        })
    }
}
