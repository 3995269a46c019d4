mod args;
mod util;

use std::path::Path;
use std::process::{ExitCode, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use taskwell::config::QueueConfig;
use taskwell::events::{Dispatcher, TracingListener};
use taskwell::failed::{self, FailedJobProvider};
use taskwell::restart::{FileRestartSignal, RestartSignal};
use taskwell::time::SystemClock;
use taskwell::worker::{memory_exceeded, EXIT_MEMORY_EXCEEDED};
use taskwell::{QueueManager, Registry, Worker};
use tokio::process::{Child, Command};
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::args::{Action, Args, Target, WorkerArgs};
use crate::util::{format_timestamp, render_table};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    match begin(args, cancel).await {
        Ok(status) => ExitCode::from(status),
        Err(error) => {
            error!(error = %format!("{error:#}"), "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

/// Runs the chosen action, returning the process exit status.
async fn begin(args: Args, cancel: CancellationToken) -> Result<u8> {
    let config = QueueConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let restart = FileRestartSignal::new(config.restart_marker.clone());

    let mut events = Dispatcher::new();
    events.listen(TracingListener);
    let manager = Arc::new(QueueManager::new(
        config,
        Arc::new(Registry::new()),
        Arc::new(events),
        Arc::new(SystemClock),
    ));

    match args.action {
        Action::Work {
            target,
            once,
            worker,
        } => work(manager, restart, target, once, worker, cancel).await,
        Action::Listen { target, worker } => {
            listen(&args.config, target, worker, cancel).await
        },
        Action::Restart => {
            restart.restart(Utc::now().timestamp()).await?;
            info!("broadcasting queue restart signal");
            Ok(0)
        },
        Action::Retry { ids } => {
            let failer = manager.failer().await?;
            retry(failer.as_ref(), &manager, &ids).await?;
            Ok(0)
        },
        Action::Forget { id } => {
            if manager.failer().await?.forget(id).await? {
                println!("Failed job deleted successfully!");
            } else {
                println!("No failed job matches the given ID.");
            }
            Ok(0)
        },
        Action::Flush => {
            manager.failer().await?.flush().await?;
            println!("All failed jobs deleted successfully!");
            Ok(0)
        },
        Action::Failed => {
            list_failed(manager.failer().await?.as_ref()).await?;
            Ok(0)
        },
        Action::Table { connection } => {
            manager.create_tables(connection.as_deref()).await?;
            Ok(0)
        },
    }
}

async fn work(
    manager: Arc<QueueManager>,
    restart: FileRestartSignal,
    target: Target,
    once: bool,
    args: WorkerArgs,
    cancel: CancellationToken,
) -> Result<u8> {
    let connection = target
        .connection
        .unwrap_or_else(|| manager.default_connection().to_owned());
    let queue = match target.queue {
        Some(queue) => queue,
        None => manager.config().connection(&connection)?.queue().to_owned(),
    };

    let failer = manager.failer().await?;
    let worker = Worker::new(manager, failer, Arc::new(restart))
        .with_quit_token(cancel)
        .with_hard_timeout();
    let options = args.options();

    if once {
        let stop = worker.run_next_job(&connection, &queue, &options).await?;
        return Ok(stop.map_or(0, |stop| stop.status));
    }

    Ok(worker.daemon(&connection, &queue, &options).await?.status)
}

/// Keeps running single-job worker processes until interrupted or this
/// process outgrows its memory limit.
async fn listen(
    config: &Path,
    target: Target,
    args: WorkerArgs,
    cancel: CancellationToken,
) -> Result<u8> {
    let exe = std::env::current_exe().context("locating own executable")?;

    let mut command = Command::new(exe);
    command.arg("--config").arg(config).arg("work");
    if let Some(connection) = &target.connection {
        command.arg(connection);
    }
    if let Some(queue) = &target.queue {
        command.arg(format!("--queue={queue}"));
    }
    command.arg("--once").args(args.to_flags()).kill_on_drop(true);

    info!(connection = ?target.connection, queue = ?target.queue, "listening");

    loop {
        let mut child = command.spawn().context("starting worker process")?;

        let waited = select! {
            waited = wait(&mut child, args.timeout) => Some(waited),
            _ = cancel.cancelled() => None,
        };

        match waited {
            None => {
                if let Err(error) = child.kill().await {
                    warn!(%error, "unable to stop worker process");
                }
                return Ok(0);
            },
            Some(Ok(Some(status))) => debug!(%status, "worker process exited"),
            Some(Ok(None)) => {
                warn!(timeout = args.timeout, "worker process timed out");
                if let Err(error) = child.kill().await {
                    warn!(%error, "unable to stop worker process");
                }
            },
            Some(Err(error)) => {
                error!(%error, "unable to wait for worker process");
            },
        }

        if memory_exceeded(args.memory) {
            warn!(memory = args.memory, "memory limit exceeded, stopping");
            return Ok(EXIT_MEMORY_EXCEEDED);
        }
    }
}

/// Waits for `child` to exit. Gives up after `timeout` seconds, unless
/// `timeout` is 0.
async fn wait(
    child: &mut Child,
    timeout: u64,
) -> std::io::Result<Option<ExitStatus>> {
    if timeout == 0 {
        return child.wait().await.map(Some);
    }

    match tokio::time::timeout(Duration::from_secs(timeout), child.wait()).await
    {
        Ok(status) => status.map(Some),
        Err(_) => Ok(None),
    }
}

async fn retry(
    failer: &dyn FailedJobProvider,
    manager: &QueueManager,
    ids: &[String],
) -> Result<()> {
    if ids.iter().any(|id| id == "all") {
        let retried = failed::retry_all(failer, manager).await?;
        println!("{retried} failed job(s) pushed back onto their queues.");
        return Ok(());
    }

    let ids = ids
        .iter()
        .map(|id| {
            id.parse::<i64>()
                .with_context(|| format!("invalid failed job id `{id}`"))
        })
        .collect::<Result<Vec<_>>>()?;

    for id in ids {
        if failed::retry(failer, manager, id).await? {
            println!("The failed job [{id}] has been pushed back onto the queue!");
        } else {
            println!("Unable to find failed job with ID [{id}].");
        }
    }

    Ok(())
}

async fn list_failed(failer: &dyn FailedJobProvider) -> Result<()> {
    let jobs = failer.all().await?;
    if jobs.is_empty() {
        println!("No failed jobs!");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                job.id.to_string(),
                job.connection.clone(),
                job.queue.clone(),
                job.job_name().unwrap_or_default(),
                format_timestamp(job.fail_time),
            ]
        })
        .collect();

    println!(
        "{}",
        render_table(&["ID", "Connection", "Queue", "Class", "Fail Time"], &rows)
    );

    Ok(())
}
