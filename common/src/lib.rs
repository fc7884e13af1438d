//! Common utilities and types for `prsync`
//!
//! This crate implements the core of `prsync`: it fans a local directory tree out into one
//! transfer job per file and runs those jobs against a remote host with many transfers in
//! flight at once, retrying each one until it succeeds.
//!
//! # Core Modules
//!
//! - [`job`] - Directory walk producing one [`job::SyncJob`] per file
//! - [`skeleton`] - One-shot creation of the remote directory tree
//! - [`transfer`] - Runs the external transfer tool for one job, retrying with jittered backoff
//! - [`scheduler`] - Bounded worker pool and completion tracking for all jobs
//! - [`retry`] - Retry policy and the per-job state machine
//! - [`remote`] - Remote endpoint (user, host, port)
//!
//! # Flow
//!
//! ```text
//! skeleton::prepare   (blocking, not retried)
//!        |
//! job::build          (walk local root, one job per file)
//!        |
//! scheduler::run      (all jobs submitted, at most max_workers running)
//!        |
//! transfer::run_job   (jitter, attempt, backoff, attempt, ... done)
//! ```
//!
//! The directory tree is always created before any file job starts. Beyond that, jobs finish
//! in whatever order the network allows.
//!
//! # Failure model
//!
//! Only configuration problems are fatal: an unusable local root or a failed directory-tree
//! transfer. A failed file transfer is logged and retried; with the default policy it is
//! retried forever, so a permanently broken job shows up as a job that never finishes.
//!
//! # Logging
//!
//! Everything is reported through `tracing`. [`run`] installs a timestamped console subscriber
//! whose level follows [`OutputConfig`] and can be overridden with `RUST_LOG`.

pub mod config;
pub mod job;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod skeleton;
pub mod transfer;
pub mod version;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn init_tracing(output: &OutputConfig) {
    let level = tracing_subscriber::filter::LevelFilter::from_level(output.log_level());
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            LOG_TIMESTAMP_FORMAT.to_string(),
        ))
        .with_target(false)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
        .with_writer(std::io::stdout)
        .try_init();
    if let Err(error) = res {
        eprintln!("failed to initialize logging: {error:#}");
    }
}

/// Runs `func` on a freshly built tokio runtime with logging set up.
///
/// Returns `None` if the runtime could not be started or `func` failed; the error has then
/// already been reported on stderr (unless quiet).
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.worker_threads > 0 {
        builder.worker_threads(runtime.worker_threads);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            eprintln!("failed to start the async runtime: {error:#}");
            return None;
        }
    };
    let res = rt.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::debug!("run failed: {:?}", &error);
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
