//! Lifecycle notifications broadcast to observers.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::types::job::JobInfo;

#[derive(Clone, Debug)]
pub enum Event {
    /// A job was reserved and is about to run.
    JobProcessing { connection: String, job: JobInfo },
    /// A job's handler returned successfully.
    JobProcessed { connection: String, job: JobInfo },
    /// A job failed permanently.
    JobFailed {
        connection: String,
        job: JobInfo,
        error: String,
    },
    /// A job's handler raised an error (whether or not it will be retried).
    JobExceptionOccurred {
        connection: String,
        job: JobInfo,
        error: String,
    },
    /// The worker is about to exit with `status`.
    WorkerStopping { status: u8 },
}

pub trait Listener: Send + Sync + 'static {
    fn handle(&self, event: &Event);
}

/// Fans events out to every registered listener, in registration order.
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Vec<Arc<dyn Listener>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, listener: impl Listener) -> &mut Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn dispatch(&self, event: Event) {
        for listener in &self.listeners {
            listener.handle(&event);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Writes one log line per lifecycle event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingListener;

impl Listener for TracingListener {
    fn handle(&self, event: &Event) {
        match event {
            Event::JobProcessing { connection, job } => info!(
                %connection,
                queue = %job.queue,
                id = ?job.id,
                attempts = job.attempts,
                "processing {}",
                job.name,
            ),
            Event::JobProcessed { connection, job } => info!(
                %connection,
                queue = %job.queue,
                id = ?job.id,
                "processed {}",
                job.name,
            ),
            Event::JobFailed {
                connection,
                job,
                error,
            } => error!(
                %connection,
                queue = %job.queue,
                id = ?job.id,
                %error,
                "failed {}",
                job.name,
            ),
            Event::JobExceptionOccurred {
                connection,
                job,
                error,
            } => warn!(
                %connection,
                queue = %job.queue,
                id = ?job.id,
                attempts = job.attempts,
                %error,
                "exception in {}",
                job.name,
            ),
            Event::WorkerStopping { status } => {
                info!(status, "worker stopping")
            },
        }
    }
}
