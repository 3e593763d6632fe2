//! Replicated document.
//!
//! A [`Document`] owns the operation log of one replica plus two views of
//! it:
//! - the live state, which always reflects every integrated op and is the
//!   only state local edits may target
//! - an optional detached view, materialised when the document is checked
//!   out to a historical frontier (or genesis)
//!
//! Every committed change is announced as a [`ChangeEvent`] to subscribers.
//! Events are queued on channels rather than dispatched through callbacks,
//! so a handler can never re-enter the document mid-commit.

use crate::oplog::{decode_changes, encode_changes, Change, Op, OpContent, OpLog};
use crate::state::{DocState, Value};
use crate::version::{Frontier, OpId, PeerId, Stamp, VersionVector};
use tokio::sync::mpsc;

/// Notification emitted after every committed change or checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The change was authored by this replica
    pub is_local: bool,
    /// The event was caused by a checkout rather than new ops
    pub from_checkout: bool,
    /// Frontier of the log (or of the checked-out view) after the event
    pub frontier: Frontier,
}

/// Outcome of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStatus {
    /// Changes (or suffixes of changes) newly integrated
    pub changes: usize,
    /// Ops newly integrated
    pub ops: usize,
    /// Changes still waiting for missing dependencies
    pub pending: usize,
}

#[derive(Debug, Clone)]
struct DetachedView {
    frontier: Frontier,
    state: DocState,
}

/// A replicated document of named record collections.
pub struct Document {
    peer: PeerId,
    oplog: OpLog,
    live: DocState,
    detached: Option<DetachedView>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

impl Document {
    /// Create an empty document for the given replica.
    #[must_use]
    pub fn new(peer: PeerId) -> Self {
        tracing::debug!(%peer, "Opened document");
        Self {
            peer,
            oplog: OpLog::new(),
            live: DocState::new(),
            detached: None,
            subscribers: Vec::new(),
        }
    }

    /// The replica id ops are authored under.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Subscribe to change events.
    ///
    /// Only events emitted after this call are delivered.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Start a transaction against the live state.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Detached`] while checked out to a past version.
    pub fn transact(&mut self) -> Result<Transaction<'_>, DocError> {
        if self.detached.is_some() {
            return Err(DocError::Detached);
        }
        let deps = self.oplog.frontier().clone();
        Ok(Transaction {
            doc: self,
            deps,
            ops: Vec::new(),
            finished: false,
        })
    }

    fn commit_ops(&mut self, deps: Frontier, ops: Vec<Op>) -> bool {
        let op_count = ops.len();
        let change = Change {
            peer: self.peer,
            deps,
            ops,
        };
        if self.oplog.append(&change).is_none() {
            return false;
        }
        tracing::debug!(
            peer = %self.peer,
            ops = op_count,
            version = %self.oplog.version(),
            "Committed change"
        );
        self.emit(ChangeEvent {
            is_local: true,
            from_checkout: false,
            frontier: self.oplog.frontier().clone(),
        });
        true
    }

    /// The state reads are served from: detached view if any, else live.
    fn visible(&self) -> &DocState {
        self.detached
            .as_ref()
            .map_or(&self.live, |view| &view.state)
    }

    /// Number of records in a collection.
    #[must_use]
    pub fn len(&self, container: &str) -> usize {
        self.visible().len(container)
    }

    /// Whether a collection has no records.
    #[must_use]
    pub fn is_empty(&self, container: &str) -> bool {
        self.len(container) == 0
    }

    /// Read a field of the record at `index`.
    #[must_use]
    pub fn get_field(&self, container: &str, index: usize, field: &str) -> Option<&Value> {
        self.visible().get(container, index, field)
    }

    /// Materialise a collection as a JSON value tree.
    #[must_use]
    pub fn deep_value(&self, container: &str) -> serde_json::Value {
        self.visible().deep_value(container)
    }

    /// Export the ops not covered by `since` (`None` exports everything).
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn export_since(&self, since: Option<&VersionVector>) -> Result<Vec<u8>, DocError> {
        encode_changes(self.oplog.changes_since(since))
    }

    /// Export the full log.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn export_all(&self) -> Result<Vec<u8>, DocError> {
        self.export_since(None)
    }

    /// Size of the full exported log in bytes.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn encoded_size(&self) -> Result<usize, DocError> {
        self.export_all().map(|bytes| bytes.len())
    }

    /// Merge a delta produced by any replica.
    ///
    /// Emits one non-local event if anything new was integrated. While
    /// detached, the log and live state advance but the visible view stays
    /// where it was checked out.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::MalformedDelta`] if the bytes cannot be decoded;
    /// the document is left untouched.
    pub fn import(&mut self, bytes: &[u8]) -> Result<ImportStatus, DocError> {
        let changes = decode_changes(bytes)?;
        let received = changes.len();
        let integrated = self.oplog.import(changes);

        let mut status = ImportStatus {
            changes: integrated.len(),
            ops: 0,
            pending: self.oplog.pending_len(),
        };
        for change in &integrated {
            for op in &change.ops {
                self.live.apply(change.peer, op);
                status.ops += 1;
            }
        }
        self.live.refresh();

        tracing::debug!(
            peer = %self.peer,
            received,
            integrated = status.changes,
            ops = status.ops,
            pending = status.pending,
            "Imported delta"
        );

        if status.ops > 0 {
            self.emit(ChangeEvent {
                is_local: false,
                from_checkout: false,
                frontier: self.oplog.frontier().clone(),
            });
        }
        Ok(status)
    }

    /// Version vector of the integrated log.
    #[must_use]
    pub fn version(&self) -> &VersionVector {
        self.oplog.version()
    }

    /// Frontier of the integrated log (the live head).
    #[must_use]
    pub fn oplog_frontier(&self) -> &Frontier {
        self.oplog.frontier()
    }

    /// Frontier of the visible state.
    #[must_use]
    pub fn state_frontier(&self) -> &Frontier {
        self.detached
            .as_ref()
            .map_or(self.oplog.frontier(), |view| &view.frontier)
    }

    /// Human-readable version vector, e.g. `"3f2a:4 9c01:2 "`.
    #[must_use]
    pub fn version_vector_display(&self) -> String {
        self.oplog.version().to_string()
    }

    /// Whether the document is checked out to a past version.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.is_some()
    }

    /// Whether every op named by `frontier` has been integrated.
    #[must_use]
    pub fn contains_frontier(&self, frontier: &Frontier) -> bool {
        self.oplog.contains_frontier(frontier)
    }

    /// Number of received changes waiting for dependencies.
    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.oplog.pending_len()
    }

    /// Switch the visible state to `frontier` (read-only).
    ///
    /// # Errors
    ///
    /// Returns [`DocError::UnknownFrontier`] if the frontier names ops this
    /// document has not integrated.
    pub fn checkout(&mut self, frontier: &Frontier) -> Result<(), DocError> {
        let version = self.oplog.closure(frontier)?;
        let state = DocState::replay(self.oplog.ops_within(&version));
        self.detached = Some(DetachedView {
            frontier: frontier.clone(),
            state,
        });
        tracing::debug!(peer = %self.peer, heads = frontier.len(), "Checked out version");
        self.emit(ChangeEvent {
            is_local: true,
            from_checkout: true,
            frontier: frontier.clone(),
        });
        Ok(())
    }

    /// Switch the visible state to the empty genesis state (read-only).
    pub fn checkout_to_genesis(&mut self) {
        self.detached = Some(DetachedView {
            frontier: Frontier::genesis(),
            state: DocState::new(),
        });
        tracing::debug!(peer = %self.peer, "Checked out genesis");
        self.emit(ChangeEvent {
            is_local: true,
            from_checkout: true,
            frontier: Frontier::genesis(),
        });
    }

    /// Return to the live head, re-enabling local edits.
    ///
    /// No event is emitted if the document was not detached.
    pub fn checkout_to_latest(&mut self) {
        if self.detached.take().is_none() {
            return;
        }
        tracing::debug!(peer = %self.peer, "Checked out latest");
        self.emit(ChangeEvent {
            is_local: true,
            from_checkout: true,
            frontier: self.oplog.frontier().clone(),
        });
    }
}

/// A batch of local ops committed atomically.
///
/// Ops are applied to the live state immediately, so reads inside the
/// transaction observe earlier writes. The batch becomes one change on
/// [`commit`](Self::commit); dropping the transaction uncommitted (for
/// example after an edit failed) discards the batch and restores the live
/// state.
pub struct Transaction<'a> {
    doc: &'a mut Document,
    deps: Frontier,
    ops: Vec<Op>,
    finished: bool,
}

impl Transaction<'_> {
    fn next_op(&self) -> Result<(OpId, Stamp), DocError> {
        let pending = u32::try_from(self.ops.len()).map_err(|_| DocError::TooManyOps)?;
        let counter = self
            .doc
            .oplog
            .version()
            .get(&self.doc.peer)
            .checked_add(pending)
            .ok_or(DocError::TooManyOps)?;
        let lamport = self.doc.oplog.next_lamport() + u64::from(pending);
        Ok((
            OpId::new(self.doc.peer, counter),
            Stamp::new(lamport, self.doc.peer),
        ))
    }

    /// Number of records in a collection of the live state.
    #[must_use]
    pub fn len(&self, container: &str) -> usize {
        self.doc.live.len(container)
    }

    /// Whether a collection of the live state is empty.
    #[must_use]
    pub fn is_empty(&self, container: &str) -> bool {
        self.len(container) == 0
    }

    /// Read a field of the live record at `index`.
    #[must_use]
    pub fn get_field(&self, container: &str, index: usize, field: &str) -> Option<&Value> {
        self.doc.live.get(container, index, field)
    }

    /// Insert an empty record at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::IndexOutOfBounds`] if `index > len`.
    pub fn insert(&mut self, container: &str, index: usize) -> Result<OpId, DocError> {
        let (id, stamp) = self.next_op()?;
        let list = self.doc.live.list_mut(container);
        let len = list.len();
        let parent = list
            .local_insert(index, id, stamp)
            .ok_or(DocError::IndexOutOfBounds { index, len })?;
        self.ops.push(Op {
            counter: id.counter,
            lamport: stamp.lamport,
            content: OpContent::Insert {
                container: container.to_string(),
                parent,
            },
        });
        Ok(id)
    }

    /// Write a field of the record at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::IndexOutOfBounds`] if there is no such record.
    pub fn set(
        &mut self,
        container: &str,
        index: usize,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), DocError> {
        let (id, stamp) = self.next_op()?;
        let value = value.into();
        let list = self.doc.live.list_mut(container);
        let len = list.len();
        let target = list
            .id_at(index)
            .ok_or(DocError::IndexOutOfBounds { index, len })?;
        list.set(&target, field, value.clone(), stamp);
        self.ops.push(Op {
            counter: id.counter,
            lamport: stamp.lamport,
            content: OpContent::Set {
                container: container.to_string(),
                target,
                field: field.to_string(),
                value,
            },
        });
        Ok(())
    }

    /// Delete the record at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::IndexOutOfBounds`] if there is no such record.
    pub fn delete(&mut self, container: &str, index: usize) -> Result<OpId, DocError> {
        let (id, stamp) = self.next_op()?;
        let list = self.doc.live.list_mut(container);
        let len = list.len();
        let target = list
            .delete_at(index)
            .ok_or(DocError::IndexOutOfBounds { index, len })?;
        self.ops.push(Op {
            counter: id.counter,
            lamport: stamp.lamport,
            content: OpContent::Delete {
                container: container.to_string(),
                target,
            },
        });
        Ok(target)
    }

    /// Commit the batch. Returns `false` if it was empty.
    pub fn commit(mut self) -> bool {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return false;
        }
        let deps = std::mem::take(&mut self.deps);
        self.doc.commit_ops(deps, ops)
    }

    /// Rebuild the live state from the log, dropping uncommitted writes.
    fn rollback(&mut self) {
        let version = self.doc.oplog.version().clone();
        let state = DocState::replay(self.doc.oplog.ops_within(&version));
        self.doc.live = state;
        tracing::debug!(
            peer = %self.doc.peer,
            discarded = self.ops.len(),
            "Rolled back uncommitted transaction"
        );
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            self.rollback();
        }
    }
}

/// Errors raised by document operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocError {
    /// Local edits are rejected while checked out to a past version
    #[error("document is checked out to a past version and is read-only")]
    Detached,
    /// A delta could not be decoded
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    /// Updates could not be encoded
    #[error("failed to encode updates: {0}")]
    Encode(String),
    /// Record index outside the collection
    #[error("index {index} out of bounds for collection of length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Collection length
        len: usize,
    },
    /// Frontier names ops this document has not integrated
    #[error("frontier references unknown operations")]
    UnknownFrontier,
    /// Per-peer op counter exhausted
    #[error("operation counter exhausted")]
    TooManyOps,
}
