//! Error types shared by connectors, stores and the worker.

use std::io;

use thiserror::Error;

/// Errors raised by the queue machinery itself, as opposed to errors raised by
/// job handlers (which are plain `anyhow::Error`s).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The relational backend failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The Redis backend failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A payload could not be encoded or decoded.
    #[error("unable to (de)serialise payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No handler is registered for a job reference.
    #[error("no handler registered for job `{0}`")]
    UnknownHandler(String),

    /// The connector cannot perform this operation.
    #[error("operation not supported by the {connector} connector: {operation}")]
    Unsupported {
        connector: &'static str,
        operation: &'static str,
    },

    /// The named connection is not configured.
    #[error("queue connection `{0}` is not configured")]
    UnknownConnection(String),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A job run inline (sync connection) raised an error.
    #[error(transparent)]
    Handler(anyhow::Error),
}

/// Raised by the worker when a job has run out of attempts or passed its
/// deadline before it could be executed.
#[derive(Debug, Error)]
#[error("{name} has been attempted too many times or run too long. The job may have previously timed out.")]
pub struct MaxAttemptsExceeded {
    pub name: String,
}

/// Raised by the worker for a reserved job whose payload can't be decoded.
#[derive(Debug, Error)]
#[error("payload could not be decoded: {reason}")]
pub struct UndecodablePayload {
    pub reason: String,
}
