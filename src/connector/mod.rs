//! Backend drivers.
//!
//! Every backend implements the same [`Connector`] contract so producers and
//! workers never care where jobs are stored.

use async_trait::async_trait;

use crate::error::QueueError;
use crate::time::Delay;
use crate::types::job::{Job, JobId};
use crate::types::payload::Payload;

pub mod database;
pub mod redis;
pub mod sync;

pub use self::database::DatabaseConnector;
pub use self::redis::RedisConnector;
pub use self::sync::SyncConnector;

/// Extra knobs for [`Connector::push_raw`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PushOptions {
    /// Make the job available later rather than immediately.
    pub delay: Option<Delay>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Name of the configured connection this connector serves.
    fn connection_name(&self) -> &str;

    /// Number of outstanding (not yet deleted) jobs. Best effort.
    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError>;

    /// Enqueues a job for immediate availability.
    async fn push(
        &self,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError>;

    /// Enqueues an already-serialised payload verbatim.
    async fn push_raw(
        &self,
        payload: &str,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Option<JobId>, QueueError>;

    /// Enqueues a job that becomes available after `delay`.
    async fn later(
        &self,
        delay: Delay,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError>;

    /// Reserves the next available job, if any. A job returned here is never
    /// handed to another caller until it is released or its lease expires.
    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError>;
}
