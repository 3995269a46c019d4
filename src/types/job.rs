use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::payload::Payload;
use super::states::JobState;
use crate::error::QueueError;
use crate::registry::Registry;

/// Name reported for a job whose payload couldn't be decoded.
const UNDECODABLE: &str = "undecodable";

/// Identifies a queued job within its backend.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobId {
    /// Database row id.
    Row(i64),
    /// Producer-assigned random token (Redis).
    Token(String),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobId::Row(id) => write!(f, "{id}"),
            JobId::Token(token) => f.write_str(token),
        }
    }
}

/// The backend half of a reserved job: whatever a connector needs to
/// acknowledge or requeue the record it handed out.
#[async_trait]
pub trait Reservation: Send + Sync {
    /// Removes the reserved record from the backend.
    async fn delete(&self) -> Result<(), QueueError>;

    /// Returns the record to the backend, available again after `delay`
    /// seconds.
    async fn release(&self, delay: u64) -> Result<(), QueueError>;

    /// Number of times the record has been reserved, including this one.
    fn attempts(&self) -> u32;

    fn job_id(&self) -> Option<JobId>;
}

/// A reserved job, owned by whoever popped it until it is deleted, released or
/// failed.
pub struct Job {
    connection: String,
    queue: String,
    raw: String,
    payload: Payload,
    malformed: Option<String>,
    deleted: bool,
    released: bool,
    failed: bool,
    reservation: Box<dyn Reservation>,
}

/// A cheap snapshot of a job, used in lifecycle events and log lines.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JobInfo {
    pub id: Option<JobId>,
    pub name: String,
    pub connection: String,
    pub queue: String,
    pub attempts: u32,
    pub state: JobState,
}

impl Job {
    /// Binds a raw payload to its reservation. The payload is parsed here and
    /// a malformed one is an error.
    pub fn new(
        connection: impl Into<String>,
        queue: impl Into<String>,
        raw: impl Into<String>,
        reservation: Box<dyn Reservation>,
    ) -> Result<Self, QueueError> {
        let raw = raw.into();
        let payload = Payload::from_json(&raw)?;

        Ok(Self {
            connection: connection.into(),
            queue: queue.into(),
            raw,
            payload,
            malformed: None,
            deleted: false,
            released: false,
            failed: false,
            reservation,
        })
    }

    /// Binds a reserved record to its reservation even when its payload can't
    /// be decoded. Such a job never runs; the worker fails it on sight.
    pub fn reserved(
        connection: impl Into<String>,
        queue: impl Into<String>,
        raw: impl Into<String>,
        reservation: Box<dyn Reservation>,
    ) -> Self {
        let raw = raw.into();
        let (payload, malformed) = match Payload::from_json(&raw) {
            Ok(payload) => (payload, None),
            Err(error) => {
                warn!(%error, "reserved a job with an undecodable payload");
                (Payload::new(UNDECODABLE, Value::Null), Some(error.to_string()))
            },
        };

        Self {
            connection: connection.into(),
            queue: queue.into(),
            raw,
            payload,
            malformed,
            deleted: false,
            released: false,
            failed: false,
            reservation,
        }
    }

    /// Runs the job's handler.
    pub async fn fire(&mut self, registry: &Registry) -> anyhow::Result<()> {
        if let Some(reason) = &self.malformed {
            anyhow::bail!("payload could not be decoded: {reason}");
        }

        let handler = registry.resolve(&self.payload)?;
        let data = self.payload.data.clone();

        handler.handle(self, data).await
    }

    /// Gives the handler a chance to compensate for a permanent failure. The
    /// hook's own errors are logged and swallowed.
    pub async fn failed(&self, registry: &Registry, error: &anyhow::Error) {
        if self.malformed.is_some() {
            return;
        }

        let handler = match registry.resolve(&self.payload) {
            Ok(handler) => handler,
            Err(error) => {
                warn!(%error, job = self.name(), "no handler to notify of failure");
                return;
            },
        };

        if let Err(hook_error) = handler.failed(&self.payload.data, error).await
        {
            warn!(
                error = ?hook_error,
                job = self.name(),
                "failure hook raised an error",
            );
        }
    }

    pub async fn delete(&mut self) -> Result<(), QueueError> {
        self.deleted = true;
        self.reservation.delete().await
    }

    pub async fn release(&mut self, delay: u64) -> Result<(), QueueError> {
        self.released = true;
        self.reservation.release(delay).await
    }

    pub fn mark_as_failed(&mut self) {
        self.failed = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_deleted_or_released(&self) -> bool {
        self.deleted || self.released
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Why the payload couldn't be decoded, if it couldn't.
    pub fn malformed(&self) -> Option<&str> {
        self.malformed.as_deref()
    }

    pub fn state(&self) -> JobState {
        if self.failed {
            JobState::Failed
        } else if self.released {
            JobState::Released
        } else if self.deleted {
            JobState::Deleted
        } else {
            JobState::Reserved
        }
    }

    pub fn attempts(&self) -> u32 {
        self.reservation.attempts()
    }

    pub fn max_tries(&self) -> Option<u32> {
        self.payload.max_tries
    }

    pub fn timeout(&self) -> Option<u64> {
        self.payload.timeout
    }

    pub fn timeout_at(&self) -> Option<i64> {
        self.payload.timeout_at
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.reservation.job_id()
    }

    pub fn name(&self) -> &str {
        self.payload.display_name()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn raw_body(&self) -> &str {
        &self.raw
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.job_id(),
            name: self.name().to_owned(),
            connection: self.connection.clone(),
            queue: self.queue.clone(),
            attempts: self.attempts(),
            state: self.state(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.job_id())
            .field("connection", &self.connection)
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .field("state", &self.state())
            .finish()
    }
}
