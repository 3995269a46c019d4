//! The worker daemon: reserve a job, run it, acknowledge it, repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::Connector;
use crate::error::{MaxAttemptsExceeded, QueueError, UndecodablePayload};
use crate::events::{Dispatcher, Event};
use crate::failed::FailedJobProvider;
use crate::manager::QueueManager;
use crate::registry::Registry;
use crate::restart::RestartSignal;
use crate::types::job::Job;

/// Exit status used when the worker stops for exceeding its memory limit.
pub const EXIT_MEMORY_EXCEEDED: u8 = 12;

/// Exit status used when a job overruns its timeout.
pub const EXIT_TIMED_OUT: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerOptions {
    /// Seconds before a failed job that will be retried becomes available.
    pub delay: u64,
    /// Seconds to idle when no job is available.
    pub sleep: u64,
    /// Attempts before a job is failed permanently; 0 retries forever.
    pub max_tries: u32,
    /// Resident memory limit in megabytes; 0 disables the check.
    pub memory: u64,
    /// Seconds a job may run for; 0 disables the limit.
    pub timeout: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            delay: 0,
            sleep: 3,
            max_tries: 0,
            memory: 128,
            timeout: 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// Asked to quit (SIGTERM, ctrl-c, or the cancellation token).
    Quit,
    /// The restart marker changed.
    Restart,
    MemoryExceeded,
    /// A job overran its timeout. It is left reserved and will be handed out
    /// again once its lease expires.
    TimedOut,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkerStop {
    pub status: u8,
    pub reason: StopReason,
}

impl WorkerStop {
    fn new(reason: StopReason) -> Self {
        let status = match reason {
            StopReason::Quit | StopReason::Restart => 0,
            StopReason::MemoryExceeded => EXIT_MEMORY_EXCEEDED,
            StopReason::TimedOut => EXIT_TIMED_OUT,
        };

        Self { status, reason }
    }
}

/// How long past its timeout a blocked job may run before the process exits.
pub const HARD_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Runs a callback on its own thread unless dropped first.
struct Watchdog {
    _disarm: mpsc::Sender<()>,
}

impl Watchdog {
    fn arm(after: Duration, on_expiry: impl FnOnce() + Send + 'static) -> Self {
        let (disarm, disarmed) = mpsc::channel::<()>();

        thread::spawn(move || {
            // Dropping the sender disconnects the channel before the deadline.
            if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(after) {
                on_expiry();
            }
        });

        Self { _disarm: disarm }
    }
}

/// How running a single job ended, as far as the loop is concerned.
enum Outcome {
    Done,
    TimedOut,
}

pub struct Worker {
    manager: Arc<QueueManager>,
    failer: Arc<dyn FailedJobProvider>,
    restart: Arc<dyn RestartSignal>,
    should_quit: CancellationToken,
    paused: Arc<AtomicBool>,
    hard_timeout: bool,
}

impl Worker {
    pub fn new(
        manager: Arc<QueueManager>,
        failer: Arc<dyn FailedJobProvider>,
        restart: Arc<dyn RestartSignal>,
    ) -> Self {
        Self {
            manager,
            failer,
            restart,
            should_quit: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            hard_timeout: false,
        }
    }

    /// Exits the whole process with status 1 when a job is still running
    /// [`HARD_TIMEOUT_GRACE`] after its timeout. The regular timeout only
    /// fires at an `.await`, so a handler blocking its thread would otherwise
    /// run on indefinitely.
    pub fn with_hard_timeout(mut self) -> Self {
        self.hard_timeout = true;
        self
    }

    /// Uses `token` as the quit signal, so an outer shutdown also stops the
    /// worker.
    pub fn with_quit_token(mut self, token: CancellationToken) -> Self {
        self.should_quit = token;
        self
    }

    /// Cancelling the returned token makes the daemon exit after the current
    /// job.
    pub fn quit_token(&self) -> CancellationToken {
        self.should_quit.clone()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn registry(&self) -> &Registry {
        self.manager.registry()
    }

    fn events(&self) -> &Dispatcher {
        self.manager.events()
    }

    /// Processes jobs from `queue` (a comma-separated list, drained left to
    /// right) until told to stop.
    pub async fn daemon(
        &self,
        connection: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> Result<WorkerStop, QueueError> {
        let connector = self.manager.connection(Some(connection)).await?;
        let last_restart = self.restart.last_restart().await?;
        let signals = self.listen_for_signals();

        info!(connection, queue, "worker started");

        let stop = loop {
            if self.is_paused() {
                self.sleep(options.sleep).await;
            } else {
                match self.get_next_job(connector.as_ref(), queue).await {
                    Some(job) => {
                        if let Outcome::TimedOut =
                            self.run_job(connection, job, options).await
                        {
                            break WorkerStop::new(StopReason::TimedOut);
                        }
                    },
                    None => self.sleep(options.sleep).await,
                }
            }

            if let Some(reason) =
                self.stop_reason(options, last_restart).await
            {
                break WorkerStop::new(reason);
            }
        };

        if let Some(signals) = signals {
            signals.abort();
        }

        self.stop(stop);
        Ok(stop)
    }

    /// Processes at most one job. Returns a stop if that job overran its
    /// timeout.
    pub async fn run_next_job(
        &self,
        connection: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> Result<Option<WorkerStop>, QueueError> {
        let connector = self.manager.connection(Some(connection)).await?;

        match self.get_next_job(connector.as_ref(), queue).await {
            Some(job) => match self.run_job(connection, job, options).await {
                Outcome::Done => Ok(None),
                Outcome::TimedOut => {
                    let stop = WorkerStop::new(StopReason::TimedOut);
                    self.stop(stop);
                    Ok(Some(stop))
                },
            },
            None => {
                self.sleep(options.sleep).await;
                Ok(None)
            },
        }
    }

    fn stop(&self, stop: WorkerStop) {
        info!(reason = ?stop.reason, status = stop.status, "worker stopping");
        self.events().dispatch(Event::WorkerStopping {
            status: stop.status,
        });
    }

    /// Tries each queue in order. Backend errors are reported and followed by
    /// a short backoff.
    async fn get_next_job(
        &self,
        connector: &dyn Connector,
        queue: &str,
    ) -> Option<Job> {
        for queue in queue.split(',').map(str::trim) {
            match connector.pop(Some(queue)).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {},
                Err(error) => {
                    error!(%error, queue, "unable to reserve a job");
                    self.sleep(1).await;
                    return None;
                },
            }
        }

        None
    }

    /// Runs a job under its timeout. Errors are reported here and never reach
    /// the loop.
    async fn run_job(
        &self,
        connection: &str,
        mut job: Job,
        options: &WorkerOptions,
    ) -> Outcome {
        let timeout = job.timeout().unwrap_or(options.timeout);
        let _watchdog = (self.hard_timeout && timeout > 0).then(|| {
            Watchdog::arm(
                Duration::from_secs(timeout) + HARD_TIMEOUT_GRACE,
                move || {
                    error!(timeout, "job blocked past its timeout, exiting");
                    std::process::exit(i32::from(EXIT_TIMED_OUT));
                },
            )
        });
        let process = self.process(connection, &mut job, options);

        let result = if timeout == 0 {
            process.await
        } else {
            match tokio::time::timeout(Duration::from_secs(timeout), process)
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        connection,
                        timeout,
                        "job exceeded its timeout, stopping worker",
                    );
                    return Outcome::TimedOut;
                },
            }
        };

        if let Err(error) = result {
            error!(error = %format!("{error:#}"), connection, "job raised an error");
        }

        Outcome::Done
    }

    /// Runs one reserved job through its lifecycle: the attempt checks, the
    /// handler, and on error either a release for another try or a permanent
    /// failure. The handler's error is returned.
    pub async fn process(
        &self,
        connection: &str,
        job: &mut Job,
        options: &WorkerOptions,
    ) -> anyhow::Result<()> {
        self.events().dispatch(Event::JobProcessing {
            connection: connection.to_owned(),
            job: job.info(),
        });

        let Err(error) = self.execute(connection, job, options).await else {
            return Ok(());
        };

        if !job.has_failed() {
            self.mark_job_as_failed_if_will_exceed_max_attempts(
                connection,
                job,
                options.max_tries,
                &error,
            )
            .await;
        }

        self.events().dispatch(Event::JobExceptionOccurred {
            connection: connection.to_owned(),
            job: job.info(),
            error: format!("{error:#}"),
        });

        if !job.is_deleted_or_released() && !job.has_failed() {
            if let Err(release_error) = job.release(options.delay).await {
                error!(error = %release_error, "unable to release job");
            }
        }

        Err(error)
    }

    async fn execute(
        &self,
        connection: &str,
        job: &mut Job,
        options: &WorkerOptions,
    ) -> anyhow::Result<()> {
        self.mark_job_as_failed_if_undecodable(connection, job).await?;
        self.mark_job_as_failed_if_already_exceeds_max_attempts(
            connection,
            job,
            options.max_tries,
        )
        .await?;

        job.fire(self.registry()).await?;

        self.events().dispatch(Event::JobProcessed {
            connection: connection.to_owned(),
            job: job.info(),
        });

        Ok(())
    }

    /// Fails a job whose payload can't be decoded. Retrying it would only
    /// fail the same way.
    async fn mark_job_as_failed_if_undecodable(
        &self,
        connection: &str,
        job: &mut Job,
    ) -> anyhow::Result<()> {
        let Some(reason) = job.malformed() else {
            return Ok(());
        };

        let error = anyhow!(UndecodablePayload {
            reason: reason.to_owned(),
        });
        self.fail_job(connection, job, &error).await;

        Err(error)
    }

    /// Fails a job that arrives with its attempts already spent or its
    /// deadline passed, which happens when an earlier run died without
    /// acknowledging it.
    async fn mark_job_as_failed_if_already_exceeds_max_attempts(
        &self,
        connection: &str,
        job: &mut Job,
        max_tries: u32,
    ) -> anyhow::Result<()> {
        let max_tries = job.max_tries().unwrap_or(max_tries);

        match job.timeout_at() {
            Some(timeout_at) if self.manager.clock().now() <= timeout_at => {
                return Ok(());
            },
            None if max_tries == 0 || job.attempts() <= max_tries => {
                return Ok(());
            },
            _ => {},
        }

        let error = anyhow!(MaxAttemptsExceeded {
            name: job.name().to_owned(),
        });
        self.fail_job(connection, job, &error).await;

        Err(error)
    }

    async fn mark_job_as_failed_if_will_exceed_max_attempts(
        &self,
        connection: &str,
        job: &mut Job,
        max_tries: u32,
        error: &anyhow::Error,
    ) {
        let max_tries = job.max_tries().unwrap_or(max_tries);

        if let Some(timeout_at) = job.timeout_at() {
            if timeout_at <= self.manager.clock().now() {
                self.fail_job(connection, job, error).await;
            }
        }

        if max_tries > 0 && job.attempts() >= max_tries {
            self.fail_job(connection, job, error).await;
        }
    }

    /// Marks the job failed, then deletes it, runs its failure hook, announces
    /// the failure and records it in the failed-job store. A job its handler
    /// already deleted is only marked.
    async fn fail_job(
        &self,
        connection: &str,
        job: &mut Job,
        error: &anyhow::Error,
    ) {
        job.mark_as_failed();
        if job.is_deleted() {
            return;
        }

        if let Err(delete_error) = job.delete().await {
            error!(error = %delete_error, "unable to delete failed job");
        }

        job.failed(self.registry(), error).await;

        self.events().dispatch(Event::JobFailed {
            connection: connection.to_owned(),
            job: job.info(),
            error: format!("{error:#}"),
        });

        match self
            .failer
            .log(connection, job.queue(), job.raw_body(), &format!("{error:?}"))
            .await
        {
            Ok(id) => debug!(?id, "recorded failed job"),
            Err(log_error) => {
                error!(error = %log_error, "unable to record failed job")
            },
        }
    }

    async fn stop_reason(
        &self,
        options: &WorkerOptions,
        last_restart: Option<i64>,
    ) -> Option<StopReason> {
        if self.should_quit.is_cancelled() {
            return Some(StopReason::Quit);
        }

        if memory_exceeded(options.memory) {
            return Some(StopReason::MemoryExceeded);
        }

        match self.restart.last_restart().await {
            Ok(current) if current != last_restart => Some(StopReason::Restart),
            Ok(_) => None,
            Err(error) => {
                warn!(%error, "unable to read restart marker");
                None
            },
        }
    }

    /// Idles for `seconds`, waking early if asked to quit.
    async fn sleep(&self, seconds: u64) {
        select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {},
            _ = self.should_quit.cancelled() => {},
        }
    }

    /// SIGTERM quits after the current job, SIGUSR2 pauses and SIGCONT
    /// resumes.
    #[cfg(unix)]
    fn listen_for_signals(&self) -> Option<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let signals = signal(SignalKind::terminate()).and_then(|term| {
            let pause = signal(SignalKind::user_defined2())?;
            let resume = signal(SignalKind::from_raw(SIGCONT))?;
            Ok((term, pause, resume))
        });
        let (mut term, mut pause, mut resume) = match signals {
            Ok(signals) => signals,
            Err(error) => {
                warn!(%error, "unable to install signal handlers");
                return None;
            },
        };

        let quit = self.should_quit.clone();
        let paused = self.paused.clone();

        Some(tokio::spawn(async move {
            loop {
                select! {
                    _ = term.recv() => {
                        info!("received SIGTERM, quitting after current job");
                        quit.cancel();
                    },
                    _ = pause.recv() => {
                        info!("received SIGUSR2, pausing");
                        paused.store(true, Ordering::SeqCst);
                    },
                    _ = resume.recv() => {
                        info!("received SIGCONT, resuming");
                        paused.store(false, Ordering::SeqCst);
                    },
                    _ = quit.cancelled() => break,
                }
            }
        }))
    }

    #[cfg(not(unix))]
    fn listen_for_signals(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// `SIGCONT`, which tokio has no named constructor for.
#[cfg(all(
    unix,
    any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
    )
))]
const SIGCONT: i32 = 19;
#[cfg(all(
    unix,
    not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
    ))
))]
const SIGCONT: i32 = 18;

/// Resident memory of this process in megabytes, where the platform exposes
/// it.
pub fn memory_usage_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let kilobytes = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .ok()?;

    Some(kilobytes / 1024)
}

pub fn memory_exceeded(limit_mb: u64) -> bool {
    limit_mb > 0 && memory_usage_mb().is_some_and(|usage| usage >= limit_mb)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::config::QueueConfig;
    use crate::connector::PushOptions;
    use crate::events::tests::RecordingListener;
    use crate::failed;
    use crate::registry::Handler;
    use crate::restart::MemoryRestartSignal;
    use crate::time::ManualClock;
    use crate::types::payload::Payload;

    /// Deletes its job, or raises while `fail` is set.
    #[derive(Clone, Default)]
    struct Flaky {
        runs: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
        names: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for Flaky {
        async fn handle(&self, job: &mut Job, data: Value) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.names
                .lock()
                .unwrap()
                .push(data["name"].as_str().unwrap_or_default().to_owned());
            anyhow::ensure!(!self.fail.load(Ordering::SeqCst), "boom");
            job.delete().await?;
            Ok(())
        }
    }

    impl Flaky {
        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    /// Cancels a token when run.
    struct Quitter(CancellationToken);

    #[async_trait]
    impl Handler for Quitter {
        async fn handle(&self, job: &mut Job, _: Value) -> anyhow::Result<()> {
            job.delete().await?;
            self.0.cancel();
            Ok(())
        }
    }

    /// Bumps the restart marker when run.
    struct Restarter(Arc<MemoryRestartSignal>);

    #[async_trait]
    impl Handler for Restarter {
        async fn handle(&self, job: &mut Job, _: Value) -> anyhow::Result<()> {
            job.delete().await?;
            self.0.restart(2).await?;
            Ok(())
        }
    }

    /// Acknowledges its job, then raises anyway.
    struct DeleteThenFail;

    #[async_trait]
    impl Handler for DeleteThenFail {
        async fn handle(&self, job: &mut Job, _: Value) -> anyhow::Result<()> {
            job.delete().await?;
            anyhow::bail!("raised after delete")
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Handler for Sleepy {
        async fn handle(&self, _: &mut Job, _: Value) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    struct Harness {
        worker: Worker,
        manager: Arc<QueueManager>,
        failer: Arc<dyn FailedJobProvider>,
        clock: Arc<ManualClock>,
        events: RecordingListener,
        restart: Arc<MemoryRestartSignal>,
    }

    impl Harness {
        async fn new(registry: Registry) -> Self {
            let config = QueueConfig::from_yaml(
                r#"
default: db
connections:
  db:
    type: database
    url: "sqlite::memory:"
failed:
  type: database
  url: "sqlite::memory:"
"#,
            )
            .unwrap();

            let events = RecordingListener::default();
            let mut dispatcher = Dispatcher::new();
            dispatcher.listen(events.clone());

            let clock = Arc::new(ManualClock::new(1_000));
            let manager = Arc::new(QueueManager::new(
                config,
                Arc::new(registry),
                Arc::new(dispatcher),
                clock.clone(),
            ));
            manager.create_tables(None).await.unwrap();

            let failer = manager.failer().await.unwrap();
            let restart = Arc::new(MemoryRestartSignal::default());
            restart.restart(1).await.unwrap();
            let worker = Worker::new(manager.clone(), failer.clone(), restart.clone());

            Self {
                worker,
                manager,
                failer,
                clock,
                events,
                restart,
            }
        }

        async fn push(&self, payload: Payload, queue: Option<&str>) {
            self.manager.enqueue(payload, queue).await.unwrap();
        }

        async fn size(&self, queue: Option<&str>) -> u64 {
            let db = self.manager.connection(None).await.unwrap();
            db.size(queue).await.unwrap()
        }

        async fn run_next(&self, options: &WorkerOptions) {
            let stop = self
                .worker
                .run_next_job("db", "default", options)
                .await
                .unwrap();
            assert_eq!(stop, None);
        }

        /// Drops the recorded events and returns them by name.
        fn take_events(&self) -> Vec<&'static str> {
            let names = self.events.names();
            self.events.events.lock().unwrap().clear();
            names
        }
    }

    fn options(max_tries: u32) -> WorkerOptions {
        WorkerOptions {
            delay: 0,
            sleep: 0,
            max_tries,
            memory: 0,
            timeout: 0,
        }
    }

    fn flaky_registry(flaky: &Flaky) -> Registry {
        let mut registry = Registry::new();
        registry.register("flaky", flaky.clone());
        registry
    }

    #[tokio::test]
    async fn test_success_deletes_job() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;
        h.run_next(&options(3)).await;

        assert_eq!(flaky.runs(), 1);
        assert_eq!(h.size(None).await, 0);
        assert_eq!(h.take_events(), vec!["JobProcessing", "JobProcessed"]);
    }

    #[tokio::test]
    async fn test_retries_until_exhausted() {
        let flaky = Flaky::default();
        flaky.fail.store(true, Ordering::SeqCst);
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;

        for _ in 0..2 {
            h.run_next(&options(3)).await;
            assert_eq!(h.size(None).await, 1);
            assert_eq!(
                h.take_events(),
                vec!["JobProcessing", "JobExceptionOccurred"]
            );
        }

        h.run_next(&options(3)).await;
        assert_eq!(
            h.take_events(),
            vec!["JobProcessing", "JobFailed", "JobExceptionOccurred"]
        );
        assert_eq!(flaky.runs(), 3);
        assert_eq!(h.size(None).await, 0);

        // Nothing left to run.
        h.run_next(&options(3)).await;
        assert_eq!(flaky.runs(), 3);

        let failed = h.failer.all().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].connection, "db");
        assert_eq!(failed[0].queue, "default");
        assert!(failed[0].exception.contains("boom"));
    }

    #[tokio::test]
    async fn test_payload_max_tries_overrides_worker() {
        let flaky = Flaky::default();
        flaky.fail.store(true, Ordering::SeqCst);
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(
            Payload::new("flaky", json!({"name": "a"})).with_max_tries(1),
            None,
        )
        .await;
        h.run_next(&options(5)).await;

        assert_eq!(flaky.runs(), 1);
        assert_eq!(h.size(None).await, 0);
        let failed = h.failer.all().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].queue, "default");
    }

    #[tokio::test]
    async fn test_release_uses_delay() {
        let flaky = Flaky::default();
        flaky.fail.store(true, Ordering::SeqCst);
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;
        let options = WorkerOptions {
            delay: 30,
            ..options(0)
        };

        h.run_next(&options).await;
        h.run_next(&options).await;
        assert_eq!(flaky.runs(), 1);

        h.clock.advance(30);
        h.run_next(&options).await;
        assert_eq!(flaky.runs(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_job_over_its_attempts_is_failed_unrun() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;

        // A worker reserves the job and dies.
        let db = h.manager.connection(None).await.unwrap();
        drop(db.pop(None).await.unwrap().unwrap());
        h.clock.advance(60);

        h.run_next(&options(1)).await;
        assert_eq!(flaky.runs(), 0);
        assert_eq!(
            h.take_events(),
            vec!["JobProcessing", "JobFailed", "JobExceptionOccurred"]
        );

        let failed = h.failer.all().await.unwrap();
        assert!(failed[0].exception.contains("attempted too many times"));
        assert_eq!(h.size(None).await, 0);
    }

    #[tokio::test]
    async fn test_deadline_takes_precedence_over_attempts() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;

        // Attempts are spent but the deadline hasn't passed: still runs.
        h.push(
            Payload::new("flaky", json!({"name": "later"}))
                .with_max_tries(1)
                .with_timeout_at(2_000),
            None,
        )
        .await;
        let db = h.manager.connection(None).await.unwrap();
        drop(db.pop(None).await.unwrap().unwrap());
        h.clock.advance(60);

        h.run_next(&options(0)).await;
        assert_eq!(flaky.runs(), 1);
        assert_eq!(h.size(None).await, 0);

        // Deadline passed: failed without running.
        h.push(
            Payload::new("flaky", json!({"name": "expired"})).with_timeout_at(1_000),
            None,
        )
        .await;
        h.run_next(&options(0)).await;
        assert_eq!(flaky.runs(), 1);
        assert_eq!(h.failer.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_can_be_retried() {
        let flaky = Flaky::default();
        flaky.fail.store(true, Ordering::SeqCst);
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;
        h.run_next(&options(1)).await;
        assert_eq!(h.size(None).await, 0);

        let id = h.failer.all().await.unwrap()[0].id;
        assert!(failed::retry(h.failer.as_ref(), &h.manager, id).await.unwrap());
        assert!(!failed::retry(h.failer.as_ref(), &h.manager, id).await.unwrap());
        assert!(h.failer.all().await.unwrap().is_empty());
        assert_eq!(h.size(None).await, 1);

        flaky.fail.store(false, Ordering::SeqCst);
        h.run_next(&options(1)).await;
        assert_eq!(flaky.runs(), 2);
        assert_eq!(h.size(None).await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;

        let db = h.manager.connection(None).await.unwrap();
        db.push_raw("not json", None, PushOptions::default())
            .await
            .unwrap();

        h.run_next(&options(3)).await;
        assert_eq!(
            h.take_events(),
            vec!["JobProcessing", "JobFailed", "JobExceptionOccurred"]
        );
        assert_eq!(h.size(None).await, 0);

        // The lease running out brings nothing back.
        h.clock.advance(61);
        h.run_next(&options(3)).await;
        assert!(h.take_events().is_empty());

        let failed = h.failer.all().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload, "not json");
        assert!(failed[0].exception.contains("could not be decoded"));
        assert_eq!(flaky.runs(), 0);
    }

    #[tokio::test]
    async fn test_failure_after_delete_still_marks_job_failed() {
        let mut registry = Registry::new();
        registry.register("delete-then-fail", DeleteThenFail);
        let h = Harness::new(registry).await;

        h.push(Payload::new("delete-then-fail", Value::Null), None).await;
        let db = h.manager.connection(None).await.unwrap();
        let mut job = db.pop(None).await.unwrap().unwrap();

        let error = h
            .worker
            .process("db", &mut job, &options(1))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("raised after delete"));

        assert!(job.has_failed());
        assert!(job.is_deleted());
        assert_eq!(h.size(None).await, 0);
        // Already acknowledged by its handler, so not dead-lettered.
        assert!(h.failer.all().await.unwrap().is_empty());
        assert_eq!(
            h.take_events(),
            vec!["JobProcessing", "JobExceptionOccurred"]
        );
    }

    #[tokio::test]
    async fn test_blank_queue_segment_means_default() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;
        h.worker
            .run_next_job("db", "high,,low", &options(0))
            .await
            .unwrap();

        assert_eq!(flaky.runs(), 1);
        assert_eq!(h.size(None).await, 0);
    }

    #[tokio::test]
    async fn test_queues_drained_in_order() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;

        h.push(Payload::new("flaky", json!({"name": "low"})), Some("low"))
            .await;
        h.push(Payload::new("flaky", json!({"name": "high"})), Some("high"))
            .await;

        for _ in 0..2 {
            h.worker
                .run_next_job("db", "high, low", &options(0))
                .await
                .unwrap();
        }

        assert_eq!(*flaky.names.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_daemon_quits_between_jobs() {
        let mut registry = Registry::new();
        let quit = CancellationToken::new();
        registry.register("quit", Quitter(quit.clone()));
        let h = Harness::new(registry).await;
        let worker = Worker::new(h.manager.clone(), h.failer.clone(), h.restart.clone())
            .with_quit_token(quit);

        h.push(Payload::new("quit", Value::Null), None).await;
        h.push(Payload::new("quit", Value::Null), None).await;

        let stop = worker.daemon("db", "default", &options(0)).await.unwrap();
        assert_eq!(stop.reason, StopReason::Quit);
        assert_eq!(stop.status, 0);

        // The second job is untouched.
        assert_eq!(h.size(None).await, 1);
        assert_eq!(
            h.take_events(),
            vec!["JobProcessing", "JobProcessed", "WorkerStopping"]
        );
    }

    #[tokio::test]
    async fn test_daemon_stops_on_restart_marker() {
        let restart = Arc::new(MemoryRestartSignal::default());
        let mut registry = Registry::new();
        registry.register("restart", Restarter(restart.clone()));
        let h = Harness::new(registry).await;
        let worker =
            Worker::new(h.manager.clone(), h.failer.clone(), restart.clone());

        h.push(Payload::new("restart", Value::Null), None).await;
        h.push(Payload::new("restart", Value::Null), None).await;

        let stop = worker.daemon("db", "default", &options(0)).await.unwrap();
        assert_eq!(stop.reason, StopReason::Restart);
        assert_eq!(stop.status, 0);
        assert_eq!(h.size(None).await, 1);
        assert_eq!(h.restart.last_restart().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_paused_worker_reserves_nothing() {
        let flaky = Flaky::default();
        let h = Harness::new(flaky_registry(&flaky)).await;
        h.push(Payload::new("flaky", json!({"name": "a"})), None).await;

        h.worker.pause();
        assert!(h.worker.is_paused());
        h.worker.quit_token().cancel();

        let stop = h.worker.daemon("db", "default", &options(0)).await.unwrap();
        assert_eq!(stop.reason, StopReason::Quit);
        assert_eq!(flaky.runs(), 0);
        assert_eq!(h.size(None).await, 1);

        h.worker.resume();
        assert!(!h.worker.is_paused());
    }

    #[tokio::test]
    async fn test_job_timeout_stops_worker() {
        let mut registry = Registry::new();
        registry.register("sleepy", Sleepy);
        let h = Harness::new(registry).await;

        // The payload's timeout applies even with the worker's disabled.
        h.push(Payload::new("sleepy", Value::Null).with_timeout(1), None)
            .await;

        let stop = h.worker.daemon("db", "default", &options(0)).await.unwrap();
        assert_eq!(
            stop,
            WorkerStop {
                status: EXIT_TIMED_OUT,
                reason: StopReason::TimedOut,
            }
        );
        assert_eq!(
            h.take_events(),
            vec!["JobProcessing", "WorkerStopping"]
        );

        // The reservation stays in place until its lease runs out.
        assert_eq!(h.size(None).await, 1);
        h.clock.advance(60);
        let db = h.manager.connection(None).await.unwrap();
        assert_eq!(db.pop(None).await.unwrap().unwrap().attempts(), 2);
    }

    #[test]
    fn test_watchdog_fires_unless_dropped() {
        let (fired, expired) = mpsc::channel();
        let _watchdog = Watchdog::arm(Duration::from_millis(20), move || {
            fired.send(()).unwrap();
        });
        assert_eq!(expired.recv_timeout(Duration::from_secs(5)), Ok(()));

        let (fired, expired) = mpsc::channel::<()>();
        let watchdog = Watchdog::arm(Duration::from_millis(200), move || {
            fired.send(()).unwrap();
        });
        drop(watchdog);
        // The callback is dropped unrun, which disconnects the channel.
        assert_eq!(
            expired.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_daemon_stops_over_memory_limit() {
        let h = Harness::new(Registry::new()).await;
        assert!(memory_usage_mb().is_some());

        let options = WorkerOptions {
            memory: 1,
            ..options(0)
        };
        let stop = h.worker.daemon("db", "default", &options).await.unwrap();
        assert_eq!(stop.status, EXIT_MEMORY_EXCEEDED);
        assert_eq!(stop.reason, StopReason::MemoryExceeded);
    }
}
