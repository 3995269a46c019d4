//! Queue configuration, read from YAML.
//!
//! ```yaml
//! default: database
//! connections:
//!   database:
//!     type: database
//!     url: sqlite://jobs.db
//!     retry_after: 90
//!   redis:
//!     type: redis
//!     url: redis://127.0.0.1/
//!     block_for: 5
//! failed:
//!   type: database
//!   url: sqlite://jobs.db
//! restart_marker: /var/run/taskwell.restart
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QueueError;

const DEFAULT_DATABASE_URL: &str = "sqlite://taskwell.db";

fn default_queue() -> String {
    "default".to_owned()
}

fn default_jobs_table() -> String {
    "jobs".to_owned()
}

fn default_failed_table() -> String {
    "failed_jobs".to_owned()
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_owned()
}

fn default_retry_after() -> u64 {
    60
}

fn default_redis_retry_after() -> Option<u64> {
    Some(60)
}

fn default_restart_marker() -> PathBuf {
    PathBuf::from("taskwell.restart")
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Connection used when none is named.
    pub default: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub failed: FailedConfig,
    #[serde(default = "default_restart_marker")]
    pub restart_marker: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Sync,
    Database {
        #[serde(default = "default_database_url")]
        url: String,
        #[serde(default = "default_jobs_table")]
        table: String,
        #[serde(default = "default_queue")]
        queue: String,
        #[serde(default = "default_retry_after")]
        retry_after: u64,
    },
    Redis {
        url: String,
        #[serde(default = "default_queue")]
        queue: String,
        /// Seconds before an unacknowledged reservation is handed out again.
        /// `null` disables lease recovery.
        #[serde(default = "default_redis_retry_after")]
        retry_after: Option<u64>,
        /// Seconds to block waiting for a job; 0 blocks indefinitely. Unset
        /// means poll without blocking.
        #[serde(default)]
        block_for: Option<u64>,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FailedConfig {
    Database {
        #[serde(default = "default_database_url")]
        url: String,
        #[serde(default = "default_failed_table")]
        table: String,
    },
    None,
}

impl Default for FailedConfig {
    fn default() -> Self {
        FailedConfig::Database {
            url: default_database_url(),
            table: default_failed_table(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let connections = BTreeMap::from([
            ("sync".to_owned(), ConnectionConfig::Sync),
            (
                "database".to_owned(),
                ConnectionConfig::Database {
                    url: default_database_url(),
                    table: default_jobs_table(),
                    queue: default_queue(),
                    retry_after: default_retry_after(),
                },
            ),
            (
                "redis".to_owned(),
                ConnectionConfig::Redis {
                    url: "redis://127.0.0.1/".to_owned(),
                    queue: default_queue(),
                    retry_after: default_redis_retry_after(),
                    block_for: None,
                },
            ),
        ]);

        Self {
            default: "database".to_owned(),
            connections,
            failed: FailedConfig::default(),
            restart_marker: default_restart_marker(),
        }
    }
}

impl QueueConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, QueueError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads the config at `path`, falling back to the built-in defaults when
    /// the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, QueueError> {
        match std::fs::read_to_string(path) {
            Ok(yaml) => Self::from_yaml(&yaml),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            },
            Err(e) => Err(e.into()),
        }
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, QueueError> {
        self.connections
            .get(name)
            .ok_or_else(|| QueueError::UnknownConnection(name.to_owned()))
    }
}

impl ConnectionConfig {
    /// Default queue of this connection.
    pub fn queue(&self) -> &str {
        match self {
            ConnectionConfig::Sync => "default",
            ConnectionConfig::Database { queue, .. }
            | ConnectionConfig::Redis { queue, .. } => queue,
        }
    }
}
