//! # linesync Core
//!
//! Replicated line document and reconciliation for linesync.
//!
//! This crate provides:
//! - Operation ids, Lamport stamps, version vectors and frontiers
//! - CRDT primitives (LWW registers, RGA list of records)
//! - An operation log with delta export/import and causal buffering
//! - A document with atomic transactions, change events and checkout
//! - Reconciliation of a flat text buffer into line-record edits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crdt;
pub mod document;
pub mod oplog;
pub mod reconcile;
pub mod state;
pub mod version;

pub use document::{ChangeEvent, DocError, Document, ImportStatus, Transaction};
pub use reconcile::{buffer_text, fingerprint, reconcile, LineRecord, LINES_CONTAINER};
pub use state::Value;
pub use version::{Frontier, OpId, PeerId, VersionVector};
