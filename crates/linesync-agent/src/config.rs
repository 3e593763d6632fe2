//! Replica configuration.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use uuid::Uuid;

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Replica unique identifier (random when unset)
    pub replica_id: Option<Uuid>,

    /// Sync channel configuration
    pub sync: SyncConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Sync channel configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Channel name shared by all replicas of the document
    pub channel: String,

    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Ask peers for missed ops on startup
    pub anti_entropy_on_start: bool,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,

    /// Key the snapshot is stored under
    pub snapshot_key: String,

    /// Also persist the version history
    pub persist_history: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            sync: SyncConfig {
                channel: "default".to_string(),
                mqtt_broker: "tcp://localhost:1883".to_string(),
                anti_entropy_on_start: true,
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./linesync.db"),
                snapshot_key: crate::persistence::DEFAULT_SNAPSHOT_KEY.to_string(),
                persist_history: false,
            },
        }
    }
}

impl ReplicaConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LINESYNC_REPLICA_ID`: Replica UUID
    /// - `LINESYNC_CHANNEL`: Sync channel name
    /// - `LINESYNC_MQTT_BROKER`: MQTT broker URL
    /// - `LINESYNC_STORE_TYPE`: "sqlite" or "memory"
    /// - `LINESYNC_DB_PATH`: `SQLite` database path
    /// - `LINESYNC_SNAPSHOT_KEY`: Snapshot key
    /// - `LINESYNC_PERSIST_HISTORY`: "true"/"false"
    /// - `LINESYNC_ANTI_ENTROPY`: "true"/"false"
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("LINESYNC_REPLICA_ID") {
            config.replica_id =
                Some(Uuid::parse_str(&id).context("Invalid LINESYNC_REPLICA_ID")?);
        }

        if let Some(channel) = lookup("LINESYNC_CHANNEL") {
            config.sync.channel = channel;
        }

        if let Some(mqtt) = lookup("LINESYNC_MQTT_BROKER") {
            config.sync.mqtt_broker = mqtt;
        }

        if let Some(flag) = lookup("LINESYNC_ANTI_ENTROPY") {
            config.sync.anti_entropy_on_start =
                parse_flag(&flag).context("Invalid LINESYNC_ANTI_ENTROPY")?;
        }

        if let Some(store_type) = lookup("LINESYNC_STORE_TYPE") {
            match store_type.as_str() {
                "sqlite" | "memory" => config.persistence.store_type = store_type,
                other => bail!("Invalid LINESYNC_STORE_TYPE '{other}'"),
            }
        }

        if let Some(db_path) = lookup("LINESYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(key) = lookup("LINESYNC_SNAPSHOT_KEY") {
            config.persistence.snapshot_key = key;
        }

        if let Some(flag) = lookup("LINESYNC_PERSIST_HISTORY") {
            config.persistence.persist_history =
                parse_flag(&flag).context("Invalid LINESYNC_PERSIST_HISTORY")?;
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
