//! MQTT topic scheme for the sync channel.
//!
//! Topic structure: `linesync/v1/{channel}/{message_type}`
//!
//! One channel name scopes one shared document; every replica of that
//! document publishes and subscribes under the same channel.

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Channel name shared by all replicas of a document
    pub channel: String,
    /// Topic prefix (default: "linesync")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a new topic scheme for the given channel.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            prefix: "linesync".to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.channel)
    }

    /// Topic carrying sync messages.
    #[must_use]
    pub fn sync(&self) -> String {
        format!("{}/sync", self.base())
    }

    /// Whether a topic carries sync messages of this channel.
    #[must_use]
    pub fn is_sync(&self, topic: &str) -> bool {
        topic == self.sync()
    }
}
