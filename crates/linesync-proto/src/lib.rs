//! # linesync Protocol
//!
//! Wire messages exchanged between replicas over the sync channel.
//!
//! ## Messages
//!
//! - `DeltaMessage`: ops committed locally since the last broadcast
//! - `AntiEntropyRequest/Response`: catch-up for deltas lost in transit
//!
//! ## MQTT Topics
//!
//! Topic scheme: `linesync/v1/{channel}/{message_type}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{AntiEntropyRequest, AntiEntropyResponse, DeltaMessage, MessageError, SyncMessage};
pub use topics::TopicScheme;
