//! Maps job references found in payloads to the code that runs them.
//!
//! Plain jobs are registered under a name (`"report"`) or a `name@method`
//! pair (`"mailer@welcome"`); a payload naming `report` or `report@fire`
//! resolves to the handler registered as `report`. Object-style jobs implement
//! [`Command`] and travel as structured JSON under their [`Command::NAME`].

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::QueueError;
use crate::types::job::Job;
use crate::types::payload::{Payload, CALL_QUEUED_HANDLER};

/// Code that runs a plain job.
///
/// A handler decides the job's fate: it should `delete` the job once the work
/// is done (or `release` it to try again later). A handler that returns `Ok`
/// without doing either leaves the job reserved until its lease expires.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: &mut Job, data: Value) -> anyhow::Result<()>;

    /// Called once the job has permanently failed.
    async fn failed(
        &self,
        _data: &Value,
        _error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A self-describing job value.
///
/// The value is serialised into the payload and rebuilt by the worker, so it
/// carries its own retry policy. Jobs are deleted automatically after
/// `handle` succeeds.
#[async_trait]
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier written to `data.commandName`.
    const NAME: &'static str;

    async fn handle(&self) -> anyhow::Result<()>;

    async fn failed(&self, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    /// Overrides the worker's `--tries` for this job.
    fn tries(&self) -> Option<u32> {
        None
    }

    /// Overrides the worker's `--timeout` for this job, in seconds.
    fn timeout(&self) -> Option<u64> {
        None
    }

    /// Keep retrying until this instant, regardless of attempts.
    fn retry_until(&self) -> Option<DateTime<Utc>> {
        None
    }
}

struct CommandHandler<C> {
    _command: PhantomData<fn() -> C>,
}

impl<C: Command> CommandHandler<C> {
    fn rebuild(data: &Value) -> anyhow::Result<C> {
        let command = data.get("command").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(command)?)
    }
}

#[async_trait]
impl<C: Command> Handler for CommandHandler<C> {
    async fn handle(&self, job: &mut Job, data: Value) -> anyhow::Result<()> {
        Self::rebuild(&data)?.handle().await?;

        if !job.is_deleted_or_released() {
            job.delete().await?;
        }

        Ok(())
    }

    async fn failed(
        &self,
        data: &Value,
        error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        Self::rebuild(data)?.failed(error).await
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    commands: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for plain jobs referencing `job`.
    pub fn register(
        &mut self,
        job: impl Into<String>,
        handler: impl Handler,
    ) -> &mut Self {
        self.handlers.insert(job.into(), Arc::new(handler));
        self
    }

    /// Registers an object-style job type.
    pub fn command<C: Command>(&mut self) -> &mut Self {
        self.commands.insert(
            C::NAME.to_owned(),
            Arc::new(CommandHandler::<C> {
                _command: PhantomData,
            }),
        );
        self
    }

    /// Finds the handler for a payload.
    pub fn resolve(
        &self,
        payload: &Payload,
    ) -> Result<Arc<dyn Handler>, QueueError> {
        if payload.job == CALL_QUEUED_HANDLER {
            let name = payload.command_name().unwrap_or_default();
            return self
                .commands
                .get(name)
                .cloned()
                .ok_or_else(|| QueueError::UnknownHandler(name.to_owned()));
        }

        if let Some(handler) = self.handlers.get(&payload.job) {
            return Ok(handler.clone());
        }

        let fallback = match payload.parsed_job() {
            (name, "fire") => self.handlers.get(name).cloned(),
            _ => None,
        };

        fallback.ok_or_else(|| QueueError::UnknownHandler(payload.job.clone()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}
