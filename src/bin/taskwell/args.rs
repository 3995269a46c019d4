use std::path::PathBuf;

use clap::{Parser, Subcommand};
use taskwell::WorkerOptions;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Path to the queue configuration file.
    #[arg(short, long, global = true, default_value = "taskwell.yaml")]
    pub(crate) config: PathBuf,
    /// Enables human-friendly logging.
    #[arg(short, long, global = true, default_value_t)]
    pub(crate) debug: bool,
    #[command(subcommand)]
    pub(crate) action: Action,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Action {
    /// Processes jobs as a long-running daemon.
    Work {
        #[command(flatten)]
        target: Target,
        /// Processes only the next job on the queue.
        #[arg(long, default_value_t)]
        once: bool,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Runs a fresh `work --once` process for each job.
    Listen {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Asks running workers to exit after their current job.
    Restart,
    /// Pushes failed jobs back onto their queues.
    Retry {
        /// Failed job ids, or `all`.
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Deletes a failed job.
    Forget { id: i64 },
    /// Deletes every failed job.
    Flush,
    /// Lists failed jobs.
    Failed,
    /// Creates the jobs and failed jobs tables.
    Table {
        /// Database connection whose jobs table to create.
        connection: Option<String>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct Target {
    /// Connection to work; the configured default if omitted.
    pub(crate) connection: Option<String>,
    /// Queues to work, comma separated, highest priority first.
    #[arg(long)]
    pub(crate) queue: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct WorkerArgs {
    /// Seconds to delay a failed job before it is retried.
    #[arg(long, default_value_t = 0)]
    pub(crate) delay: u64,
    /// Memory limit in megabytes.
    #[arg(long, default_value_t = 128)]
    pub(crate) memory: u64,
    /// Seconds a job may run for.
    #[arg(long, default_value_t = 60)]
    pub(crate) timeout: u64,
    /// Seconds to sleep when no job is available.
    #[arg(long, default_value_t = 3)]
    pub(crate) sleep: u64,
    /// Attempts before a job is failed; 0 retries forever.
    #[arg(long, default_value_t = 0)]
    pub(crate) tries: u32,
}

impl WorkerArgs {
    pub(crate) fn options(&self) -> WorkerOptions {
        WorkerOptions {
            delay: self.delay,
            sleep: self.sleep,
            max_tries: self.tries,
            memory: self.memory,
            timeout: self.timeout,
        }
    }

    /// The same settings as `work` command-line flags.
    pub(crate) fn to_flags(&self) -> Vec<String> {
        vec![
            format!("--delay={}", self.delay),
            format!("--memory={}", self.memory),
            format!("--timeout={}", self.timeout),
            format!("--sleep={}", self.sleep),
            format!("--tries={}", self.tries),
        ]
    }
}
