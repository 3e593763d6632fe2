//! Replica orchestration.
//!
//! A [`Replica`] owns one document and wires its change events to the
//! version history, the sync channel and persistence. Events are queued by
//! the document and dispatched after each mutation, so no handler ever
//! mutates the document re-entrantly.

use crate::history::{HistoryError, Position, VersionHistory};
use crate::persistence::{PersistenceError, PersistenceStore};
use crate::replication::{Inbound, SyncChannel, SyncError, Transport};
use linesync_core::{ChangeEvent, DocError, Document, VersionVector};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One replica of the shared line document.
pub struct Replica {
    doc: Document,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    history: VersionHistory,
    sync: SyncChannel,
    persistence: PersistenceStore,
    /// Version at the last automatic catch-up request
    catch_up_at: Option<VersionVector>,
}

impl Replica {
    /// Open a replica, restoring the persisted snapshot if there is one.
    ///
    /// The document is subscribed to before the snapshot is replayed, so the
    /// restore is observed like any other change. Unreadable snapshots are
    /// reported and the replica starts empty.
    pub fn open(
        replica_id: Uuid,
        persistence: PersistenceStore,
        transport: Box<dyn Transport + Send>,
        request_catch_up: bool,
    ) -> Self {
        let mut doc = Document::new(replica_id);
        let events = doc.subscribe();
        let mut replica = Self {
            doc,
            events,
            history: VersionHistory::new(),
            sync: SyncChannel::new(transport, replica_id),
            persistence,
            catch_up_at: None,
        };

        replica.restore();

        if request_catch_up {
            if let Err(err) = replica.sync.request_catch_up(&replica.doc) {
                tracing::warn!(error = %err, "Failed to request catch-up");
            }
        }

        tracing::info!(
            replica = %replica_id,
            versions = replica.history.len(),
            "Replica opened"
        );
        replica
    }

    fn restore(&mut self) {
        let Some(snapshot) = self.persistence.load_at_startup() else {
            return;
        };
        // Read before replaying, which records (and saves) a fresh history.
        let stored_history = self.persistence.load_history();

        self.doc.checkout_to_latest();
        match self.doc.import(&snapshot) {
            Ok(status) => {
                tracing::info!(
                    key = self.persistence.key(),
                    ops = status.ops,
                    size = snapshot.len(),
                    "Restored snapshot"
                );
            }
            Err(err) => {
                let err = PersistenceError::RestoreFailed(err.to_string());
                tracing::warn!(error = %err, "Starting from an empty document");
            }
        }
        self.pump();

        if let Some(frontiers) = stored_history {
            if frontiers.iter().all(|f| self.doc.contains_frontier(f)) {
                tracing::debug!(versions = frontiers.len(), "Restored version history");
                self.history = VersionHistory::from_frontiers(frontiers);
                if let Err(err) = self.persistence.save_history(self.history.frontiers()) {
                    tracing::warn!(error = %err, "Failed to persist version history");
                }
            } else {
                tracing::warn!("Stored history does not match snapshot, discarding");
            }
        }
        self.history.reset_to_live();
    }

    /// Dispatch every queued change event.
    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(&event);
        }
    }

    fn dispatch(&mut self, event: &ChangeEvent) {
        if self
            .history
            .record_on_commit(&event.frontier, event.from_checkout)
        {
            if let Err(err) = self.persistence.save_history(self.history.frontiers()) {
                tracing::warn!(error = %err, "Failed to persist version history");
            }
        }

        if let Err(err) = self.sync.on_commit(&self.doc, event) {
            tracing::warn!(error = %err, "Failed to broadcast change");
        }

        if let Err(err) = self.persistence.on_commit(&self.doc, event) {
            tracing::warn!(error = %err, "Snapshot not saved; change kept in memory");
        }
    }

    /// Text of the visible document, lines joined by `\n`.
    #[must_use]
    pub fn buffer_text(&self) -> String {
        linesync_core::buffer_text(&self.doc)
    }

    /// Reconcile the document with an edited buffer.
    ///
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Detached`] (wrapped) while a past version is
    /// selected.
    pub fn apply_edited_buffer(&mut self, text: &str) -> Result<bool, ReplicaError> {
        let changed = linesync_core::reconcile(&mut self.doc, text);
        self.pump();
        Ok(changed?)
    }

    /// Selectable version indices, `(-1, len - 1)`.
    #[must_use]
    pub fn version_range(&self) -> (i64, i64) {
        self.history.range()
    }

    /// Currently selected version index.
    #[must_use]
    pub fn current_version(&self) -> i64 {
        self.history.current_index()
    }

    /// Current history position.
    #[must_use]
    pub fn position(&self) -> Position {
        self.history.position()
    }

    /// Show the version at `index` (`len - 1` returns to the editable head).
    ///
    /// # Errors
    ///
    /// Returns error if `index` is out of range.
    pub fn select_version(&mut self, index: i64) -> Result<Position, ReplicaError> {
        let position = self.history.checkout(&mut self.doc, index);
        self.pump();
        Ok(position?)
    }

    /// Human-readable version vector.
    #[must_use]
    pub fn version_vector_display(&self) -> String {
        self.doc.version_vector_display()
    }

    /// Size of the full exported log in bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the log cannot be encoded.
    pub fn document_size_bytes(&self) -> Result<usize, ReplicaError> {
        Ok(self.doc.encoded_size()?)
    }

    /// Erase persisted state and start over with an empty document.
    ///
    /// The fresh document gets a new replica id, since peers already know
    /// the op counters issued under the old one.
    ///
    /// # Errors
    ///
    /// Returns error if persisted state cannot be erased; the in-memory
    /// document is reset regardless.
    pub fn clear_and_reset(&mut self) -> Result<(), ReplicaError> {
        let cleared = self.persistence.clear();

        let replica_id = Uuid::new_v4();
        self.doc = Document::new(replica_id);
        self.events = self.doc.subscribe();
        self.history = VersionHistory::new();
        self.sync.reset(replica_id);
        self.catch_up_at = None;

        tracing::info!(replica = %replica_id, "Replica cleared and reset");
        Ok(cleared?)
    }

    /// Handle one frame received from the sync channel.
    ///
    /// A delta that cannot be integrated because earlier ops were lost
    /// triggers a catch-up request, at most once per local version.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedDelta`] (wrapped) for undecodable
    /// frames; the message is dropped and the replica is unaffected.
    pub fn receive(&mut self, frame: &[u8]) -> Result<Inbound, ReplicaError> {
        let inbound = self.sync.handle(&mut self.doc, frame);
        self.pump();
        match inbound {
            Ok(inbound) => {
                if matches!(inbound, Inbound::Imported(status) if status.pending > 0) {
                    self.catch_up_if_behind();
                }
                Ok(inbound)
            }
            Err(err) => {
                tracing::warn!(error = %err, len = frame.len(), "Dropped sync message");
                Err(err.into())
            }
        }
    }

    /// Request catch-up if changes are waiting for missing ops and no
    /// request was made at the current version yet.
    ///
    /// Returns whether a request was sent.
    pub fn catch_up_if_behind(&mut self) -> bool {
        if self.doc.pending_changes() == 0
            || self.catch_up_at.as_ref() == Some(self.doc.version())
        {
            return false;
        }
        self.catch_up_at = Some(self.doc.version().clone());
        tracing::debug!(pending = self.doc.pending_changes(), "Missing ops, requesting catch-up");
        match self.sync.request_catch_up(&self.doc) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to request catch-up");
                false
            }
        }
    }

    /// Ask peers again for missed ops.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent.
    pub fn request_catch_up(&self) -> Result<(), ReplicaError> {
        Ok(self.sync.request_catch_up(&self.doc)?)
    }

    /// Replica id currently stamped on outgoing changes.
    #[must_use]
    pub fn replica_id(&self) -> Uuid {
        self.doc.peer_id()
    }

    /// The underlying document.
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// The version history.
    #[must_use]
    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    /// Dispatch outstanding events and shut down.
    pub fn close(mut self) {
        self.pump();
        tracing::info!(
            replica = %self.doc.peer_id(),
            versions = self.history.len(),
            "Replica closed"
        );
    }
}

/// Errors surfaced by [`Replica`].
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// Document rejected the operation
    #[error(transparent)]
    Document(#[from] DocError),
    /// Version selection failed
    #[error(transparent)]
    History(#[from] HistoryError),
    /// Sync message could not be handled
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// Persisted state could not be accessed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{KeyValueStore, MemoryStore};
    use crate::replication::LocalBus;
    use tokio_test::{assert_err, assert_ok};

    fn memory_replica(bus: &LocalBus) -> Replica {
        let persistence = PersistenceStore::new(Box::new(MemoryStore::new()), "store");
        Replica::open(
            Uuid::new_v4(),
            persistence,
            Box::new(bus.endpoint().sender()),
            false,
        )
    }

    #[test]
    fn history_follows_edits() {
        let bus = LocalBus::new("test", 16);
        let mut replica = memory_replica(&bus);

        assert!(assert_ok!(replica.apply_edited_buffer("x")));
        assert_eq!(replica.version_range(), (-1, 0));
        assert!(assert_ok!(replica.apply_edited_buffer("y")));
        assert_eq!(replica.version_range(), (-1, 1));

        assert_eq!(assert_ok!(replica.select_version(0)), Position::Historical(0));
        assert_eq!(replica.buffer_text(), "x");
        assert_eq!(assert_ok!(replica.select_version(1)), Position::Live);
        assert_eq!(replica.buffer_text(), "y");
        assert_eq!(
            replica.document().get_field(
                linesync_core::LINES_CONTAINER,
                0,
                linesync_core::reconcile::FINGERPRINT_FIELD
            ),
            Some(&linesync_core::Value::Int(121))
        );
    }

    #[test]
    fn unchanged_buffer_adds_no_version() {
        let bus = LocalBus::new("test", 16);
        let mut replica = memory_replica(&bus);

        assert!(assert_ok!(replica.apply_edited_buffer("a\nb")));
        assert!(!assert_ok!(replica.apply_edited_buffer("a\nb")));
        assert_eq!(replica.history().len(), 1);
    }

    #[test]
    fn past_versions_are_read_only() {
        let bus = LocalBus::new("test", 16);
        let mut replica = memory_replica(&bus);
        replica.apply_edited_buffer("x").unwrap();
        replica.apply_edited_buffer("y").unwrap();

        replica.select_version(-1).unwrap();
        assert_eq!(replica.buffer_text(), "");
        assert!(matches!(
            replica.apply_edited_buffer("z"),
            Err(ReplicaError::Document(DocError::Detached))
        ));
        assert_eq!(replica.history().len(), 2);

        assert!(matches!(
            replica.select_version(5),
            Err(ReplicaError::History(HistoryError::IndexOutOfRange { index: 5, len: 2 }))
        ));
    }

    #[test]
    fn restore_from_snapshot_starts_live() {
        let bus = LocalBus::new("test", 16);
        let mut store = MemoryStore::new();
        {
            let mut replica = memory_replica(&bus);
            replica.apply_edited_buffer("one\ntwo").unwrap();
            let snapshot = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                replica.document().export_all().unwrap(),
            );
            store.set("store", &snapshot).unwrap();
        }

        let mut replica = Replica::open(
            Uuid::new_v4(),
            PersistenceStore::new(Box::new(store), "store"),
            Box::new(bus.endpoint().sender()),
            false,
        );
        assert_eq!(replica.buffer_text(), "one\ntwo");
        assert_eq!(replica.position(), Position::Live);
        assert_eq!(replica.version_range(), (-1, 0));
        assert!(assert_ok!(replica.apply_edited_buffer("one\ntwo\nthree")));
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let bus = LocalBus::new("test", 16);
        let mut store = MemoryStore::new();
        store.set("store", "bm90IGEgZGVsdGE=").unwrap();

        let replica = Replica::open(
            Uuid::new_v4(),
            PersistenceStore::new(Box::new(store), "store"),
            Box::new(bus.endpoint().sender()),
            false,
        );
        assert_eq!(replica.buffer_text(), "");
        assert!(replica.history().is_empty());
    }

    #[test]
    fn full_store_keeps_editing() {
        let bus = LocalBus::new("test", 16);
        let mut peer = bus.endpoint();
        let persistence = PersistenceStore::new(Box::new(MemoryStore::with_capacity(4)), "store");
        let mut replica = Replica::open(
            Uuid::new_v4(),
            persistence,
            Box::new(bus.endpoint().sender()),
            false,
        );

        assert!(assert_ok!(replica.apply_edited_buffer("too large to store")));
        assert_eq!(replica.buffer_text(), "too large to store");
        assert_eq!(replica.history().len(), 1);
        assert!(peer.try_recv().is_some());
    }

    #[test]
    fn clear_and_reset_uses_new_identity() {
        let bus = LocalBus::new("test", 16);
        let mut replica = memory_replica(&bus);
        replica.apply_edited_buffer("x").unwrap();
        let old_id = replica.replica_id();

        assert_ok!(replica.clear_and_reset());
        assert_ne!(replica.replica_id(), old_id);
        assert_eq!(replica.buffer_text(), "");
        assert_eq!(replica.version_range(), (-1, -1));
        assert_eq!(replica.version_vector_display(), "");
        assert!(assert_ok!(replica.apply_edited_buffer("fresh")));
    }

    #[test]
    fn malformed_frame_is_reported() {
        let bus = LocalBus::new("test", 16);
        let mut replica = memory_replica(&bus);
        replica.apply_edited_buffer("x").unwrap();

        assert_err!(replica.receive(b"not cbor"));
        assert_eq!(replica.buffer_text(), "x");
        assert_eq!(replica.history().len(), 1);
    }

    #[test]
    fn gap_triggers_one_catch_up_request() {
        let bus = LocalBus::new("test", 16);
        let mut author = memory_replica(&bus);
        let mut peer = bus.endpoint();
        let mut replica = memory_replica(&bus);

        author.apply_edited_buffer("x").unwrap();
        author.apply_edited_buffer("y").unwrap();
        let _lost = peer.try_recv().unwrap();
        let second = peer.try_recv().unwrap();

        for _ in 0..3 {
            assert!(matches!(
                assert_ok!(replica.receive(&second)),
                Inbound::Imported(status) if status.pending == 1
            ));
        }
        assert_eq!(replica.document().pending_changes(), 1);

        // One request, not one per redelivery.
        let request = peer.try_recv().unwrap();
        assert!(matches!(
            linesync_proto::SyncMessage::from_cbor(&request),
            Ok(linesync_proto::SyncMessage::AntiEntropyRequest(_))
        ));
        assert_eq!(peer.try_recv(), None);
        assert!(!replica.catch_up_if_behind());
    }

    #[test]
    fn document_size_grows_with_edits() {
        let bus = LocalBus::new("test", 16);
        let mut replica = memory_replica(&bus);
        let empty = assert_ok!(replica.document_size_bytes());

        replica.apply_edited_buffer("some text").unwrap();
        assert!(assert_ok!(replica.document_size_bytes()) > empty);
    }
}
