//! # linesync Agent
//!
//! Replica runtime for a collaboratively edited line document.
//!
//! ## Architecture
//!
//! Every committed change of the document is dispatched, in order, to:
//! 1. **History**: records the frontier so past versions can be selected
//! 2. **Sync**: broadcasts local changes to the other replicas
//! 3. **Persistence**: overwrites the stored snapshot
//!
//! Inbound sync messages are merged into the document and go through the
//! same pipeline, except that they are never re-broadcast.

#![warn(missing_docs)]

pub mod config;
pub mod history;
pub mod persistence;
pub mod replication;
pub mod runtime;

pub use config::ReplicaConfig;
pub use history::{HistoryError, Position, VersionHistory};
pub use persistence::{
    open_store, KeyValueStore, MemoryStore, PersistenceError, PersistenceStore, SqliteStore,
    StoreError,
};
pub use replication::{
    BusEndpoint, BusSender, Inbound, LocalBus, MqttTransport, SyncChannel, SyncError, Transport,
    TransportError,
};
pub use runtime::{Replica, ReplicaError};
