use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;
use crate::registry::Command;

/// Handler reference carried by object-style jobs. The concrete job type is
/// named by `data.commandName`.
pub const CALL_QUEUED_HANDLER: &str = "CallQueuedHandler@call";

/// The wire envelope describing one unit of work.
///
/// Field names are shared by every backend and by the retry tooling, so they
/// are fixed: `job`, `data`, `maxTries`, `timeout`, `timeoutAt`, plus `id` and
/// `attempts` on Redis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// `name` or `name@method`.
    pub job: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "maxTries", default)]
    pub max_tries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(
        rename = "timeoutAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl Payload {
    /// A plain job: `job` names a registered handler, `data` is passed to it
    /// verbatim.
    pub fn new(job: impl Into<String>, data: Value) -> Self {
        Self {
            job: job.into(),
            data,
            max_tries: None,
            timeout: None,
            timeout_at: None,
            id: None,
            attempts: None,
        }
    }

    /// An object-style job: the command value itself is stored as structured
    /// JSON and rebuilt by the worker from `commandName`.
    pub fn command<C: Command>(command: &C) -> Result<Self, QueueError> {
        Ok(Self {
            job: CALL_QUEUED_HANDLER.to_owned(),
            data: serde_json::json!({
                "commandName": C::NAME,
                "command": serde_json::to_value(command)?,
            }),
            max_tries: command.tries(),
            timeout: command.timeout(),
            timeout_at: command.retry_until().map(|at| at.timestamp()),
            id: None,
            attempts: None,
        })
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_timeout_at(mut self, timestamp: i64) -> Self {
        self.timeout_at = Some(timestamp);
        self
    }

    /// Splits `job` into `(handler, method)`. A bare name uses `fire`.
    pub fn parsed_job(&self) -> (&str, &str) {
        self.job.split_once('@').unwrap_or((self.job.as_str(), "fire"))
    }

    /// Human-facing job name: the command type for object-style jobs,
    /// otherwise the handler reference.
    pub fn display_name(&self) -> &str {
        if self.job == CALL_QUEUED_HANDLER {
            if let Some(name) = self.command_name() {
                return name;
            }
        }

        &self.job
    }

    pub(crate) fn command_name(&self) -> Option<&str> {
        self.data.get("commandName").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Rewrites a raw payload with its `attempts` counter set back to zero, if it
/// has one. Other fields pass through untouched.
pub fn reset_attempts(raw: &str) -> Result<String, QueueError> {
    let mut payload: Value = serde_json::from_str(raw)?;

    if let Some(attempts) = payload.get_mut("attempts") {
        *attempts = Value::from(0);
    }

    Ok(serde_json::to_string(&payload)?)
}
