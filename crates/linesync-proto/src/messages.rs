//! Protocol messages for delta replication.

use linesync_core::VersionVector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ops committed by one replica, relative to its previous broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaMessage {
    /// Replica that produced the delta
    pub origin: Uuid,
    /// Opaque document delta
    pub payload: Vec<u8>,
}

/// Request for every op the sender has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiEntropyRequest {
    /// Requesting replica
    pub origin: Uuid,
    /// What the requester already has
    pub version: VersionVector,
}

/// Answer to an [`AntiEntropyRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiEntropyResponse {
    /// Answering replica
    pub origin: Uuid,
    /// Replica that asked
    pub target: Uuid,
    /// Opaque document delta covering what the target is missing
    pub payload: Vec<u8>,
}

/// Envelope of everything sent over the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Incremental delta broadcast
    Delta(DeltaMessage),
    /// Catch-up request
    AntiEntropyRequest(AntiEntropyRequest),
    /// Catch-up response
    AntiEntropyResponse(AntiEntropyResponse),
}

impl SyncMessage {
    /// Create a delta message.
    #[must_use]
    pub fn delta(origin: Uuid, payload: Vec<u8>) -> Self {
        Self::Delta(DeltaMessage { origin, payload })
    }

    /// Replica that sent this message.
    #[must_use]
    pub fn origin(&self) -> Uuid {
        match self {
            Self::Delta(msg) => msg.origin,
            Self::AntiEntropyRequest(msg) => msg.origin,
            Self::AntiEntropyResponse(msg) => msg.origin,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
