//! A job queue with interchangeable backends.
//!
//! Producers push [`Payload`]s through a [`Connector`]; a [`Worker`] reserves
//! them, runs the handler registered for each in the [`Registry`], and
//! deletes, releases or fails the job depending on the outcome.

pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod failed;
pub mod manager;
pub mod registry;
pub mod restart;
pub mod time;
pub mod types;
pub mod worker;

pub use crate::connector::Connector;
pub use crate::error::QueueError;
pub use crate::manager::QueueManager;
pub use crate::registry::{Command, Handler, Registry};
pub use crate::types::job::Job;
pub use crate::types::payload::Payload;
pub use crate::worker::{Worker, WorkerOptions};
