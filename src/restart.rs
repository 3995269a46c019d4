//! The restart marker: a timestamp that running workers compare against the
//! value they saw at startup. Bumping it makes every worker exit gracefully
//! after its current job.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::QueueError;

#[async_trait]
pub trait RestartSignal: Send + Sync {
    /// Timestamp of the most recent restart request, if any was ever made.
    async fn last_restart(&self) -> Result<Option<i64>, QueueError>;

    async fn restart(&self, timestamp: i64) -> Result<(), QueueError>;
}

/// Stores the marker in a file shared by every worker on the host.
#[derive(Clone, Debug)]
pub struct FileRestartSignal {
    path: PathBuf,
}

impl FileRestartSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RestartSignal for FileRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>, QueueError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn restart(&self, timestamp: i64) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&self.path, timestamp.to_string()).await?;
        debug!(path = %self.path.display(), timestamp, "wrote restart marker");

        Ok(())
    }
}

/// In-process marker, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryRestartSignal {
    last: Mutex<Option<i64>>,
}

#[async_trait]
impl RestartSignal for MemoryRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>, QueueError> {
        Ok(*self.last.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn restart(&self, timestamp: i64) -> Result<(), QueueError> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(timestamp);
        Ok(())
    }
}
