//! Runs jobs inline, in the producer's task. Handy in development and tests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Connector, PushOptions};
use crate::error::QueueError;
use crate::events::{Dispatcher, Event};
use crate::registry::Registry;
use crate::time::Delay;
use crate::types::job::{Job, JobId, Reservation};
use crate::types::payload::Payload;

pub struct SyncConnector {
    registry: Arc<Registry>,
    events: Arc<Dispatcher>,
    connection: String,
}

impl SyncConnector {
    pub fn new(registry: Arc<Registry>, events: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            events,
            connection: "sync".to_owned(),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection = name.into();
        self
    }

    async fn run(&self, mut job: Job) -> Result<(), QueueError> {
        self.events.dispatch(Event::JobProcessing {
            connection: self.connection.clone(),
            job: job.info(),
        });

        match job.fire(&self.registry).await {
            Ok(()) => {
                self.events.dispatch(Event::JobProcessed {
                    connection: self.connection.clone(),
                    job: job.info(),
                });
                Ok(())
            },
            Err(error) => {
                job.mark_as_failed();
                job.failed(&self.registry, &error).await;

                self.events.dispatch(Event::JobFailed {
                    connection: self.connection.clone(),
                    job: job.info(),
                    error: format!("{error:#}"),
                });

                Err(QueueError::Handler(error))
            },
        }
    }
}

#[async_trait]
impl Connector for SyncConnector {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    async fn size(&self, _queue: Option<&str>) -> Result<u64, QueueError> {
        Ok(0)
    }

    /// Executes the job before returning. A handler error is handed straight
    /// back to the producer.
    async fn push(
        &self,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        let raw = payload.to_json()?;
        let queue = queue.unwrap_or("default");
        debug!(queue, job = payload.display_name(), "running job inline");

        let job = Job::new(&self.connection, queue, raw, Box::new(InlineRun))?;
        self.run(job).await?;

        Ok(None)
    }

    async fn push_raw(
        &self,
        _payload: &str,
        _queue: Option<&str>,
        _options: PushOptions,
    ) -> Result<Option<JobId>, QueueError> {
        Err(QueueError::Unsupported {
            connector: "sync",
            operation: "push_raw",
        })
    }

    /// There is nothing to wait on: the job runs now.
    async fn later(
        &self,
        _delay: Delay,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        self.push(payload, queue).await
    }

    async fn pop(&self, _queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        Ok(None)
    }
}

/// Inline jobs have no backing record.
struct InlineRun;

#[async_trait]
impl Reservation for InlineRun {
    async fn delete(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn release(&self, _delay: u64) -> Result<(), QueueError> {
        Ok(())
    }

    fn attempts(&self) -> u32 {
        1
    }

    fn job_id(&self) -> Option<JobId> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value};

    use super::*;
    use crate::events::tests::RecordingListener;
    use crate::registry::Handler;

    #[derive(Clone, Default)]
    struct Counter {
        runs: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for Counter {
        async fn handle(&self, job: &mut Job, data: Value) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(data["ok"] == true, "refusing to run");
            job.delete().await?;
            Ok(())
        }

        async fn failed(
            &self,
            _data: &Value,
            _error: &anyhow::Error,
        ) -> anyhow::Result<()> {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connector(counter: &Counter, recorder: &RecordingListener) -> SyncConnector {
        let mut registry = Registry::new();
        registry.register("count", counter.clone());
        let mut events = Dispatcher::new();
        events.listen(recorder.clone());

        SyncConnector::new(Arc::new(registry), Arc::new(events))
    }

    #[tokio::test]
    async fn test_push_runs_inline() {
        let counter = Counter::default();
        let recorder = RecordingListener::default();
        let sync = connector(&counter, &recorder);

        let id = sync
            .push(Payload::new("count", json!({"ok": true})), None)
            .await
            .unwrap();
        assert!(id.is_none());
        assert_eq!(counter.runs.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.names(), vec!["JobProcessing", "JobProcessed"]);

        sync.later(Delay::Seconds(60), Payload::new("count", json!({"ok": true})), None)
            .await
            .unwrap();
        assert_eq!(counter.runs.load(Ordering::SeqCst), 2);

        assert_eq!(sync.size(None).await.unwrap(), 0);
        assert!(sync.pop(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_surfaces_handler_error() {
        let counter = Counter::default();
        let recorder = RecordingListener::default();
        let sync = connector(&counter, &recorder);

        let error = sync
            .push(Payload::new("count", json!({"ok": false})), None)
            .await
            .unwrap_err();

        assert!(matches!(error, QueueError::Handler(_)));
        assert!(error.to_string().contains("refusing to run"));
        assert_eq!(counter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.names(), vec!["JobProcessing", "JobFailed"]);
    }

    #[tokio::test]
    async fn test_push_raw_unsupported() {
        let sync = connector(&Counter::default(), &RecordingListener::default());
        let result = sync.push_raw("{}", None, PushOptions::default()).await;

        assert!(matches!(
            result,
            Err(QueueError::Unsupported { connector: "sync", .. })
        ));
    }
}
