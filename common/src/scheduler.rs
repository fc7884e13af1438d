//! Worker pool that runs all sync jobs
//!
//! All jobs are submitted up front. Each runs in its own task but must first take one of
//! `max_workers` worker slots, which it holds through its delays and attempts until it is done.
//! Finished jobs report back over a channel to a single aggregator which owns the count of jobs
//! still in flight and logs progress every `poll_interval`.

use anyhow::anyhow;
use tracing::instrument;

use crate::job::SyncJob;
use crate::progress;
use crate::retry::{JobStatus, RetryPolicy};
use crate::transfer::{self, JobOutcome, Transport};

pub const DEFAULT_MAX_WORKERS: usize = 25;
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
/// Shorter poll intervals are raised to this.
pub const MIN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Maximum number of jobs running at the same time, `0` means no limit.
    pub max_workers: usize,
    /// How often progress is logged while waiting for jobs, at least [`MIN_POLL_INTERVAL`].
    pub poll_interval: std::time::Duration,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Error type for a run that did not complete every job, carrying what was achieved.
///
/// The Display implementation shows the full error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub jobs: usize,
    pub succeeded: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    pub attempts: u64,
    pub failed_attempts: u64,
    pub elapsed: std::time::Duration,
}

impl Summary {
    fn record(&mut self, outcome: &JobOutcome) {
        self.attempts += u64::from(outcome.attempts);
        self.failed_attempts += u64::from(outcome.failed_attempts);
        match outcome.status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Abandoned => self.abandoned += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Jobs that have not reported an outcome.
    pub fn unfinished(&self) -> usize {
        self.jobs - self.succeeded - self.abandoned - self.cancelled
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "jobs: {}\n\
            succeeded: {}\n\
            abandoned: {}\n\
            cancelled: {}\n\
            transfer attempts: {}\n\
            failed attempts: {}\n\
            elapsed: {}",
            self.jobs,
            self.succeeded,
            self.abandoned,
            self.cancelled,
            self.attempts,
            self.failed_attempts,
            humantime::format_duration(std::time::Duration::from_millis(
                u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
            )),
        )
    }
}

/// Runs every job and waits until all of them have reported back.
///
/// Under the default retry policy a job only finishes by succeeding, so this returns `Ok` once
/// everything has been transferred, or keeps waiting. A run fails only when jobs were abandoned
/// under a bounded policy, were cancelled, or a job task died.
#[instrument(skip_all, fields(jobs = jobs.len()))]
pub async fn run<T: Transport>(
    transport: std::sync::Arc<T>,
    jobs: Vec<SyncJob>,
    settings: &Settings,
    progress: std::sync::Arc<progress::Progress>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Summary, Error> {
    let start_time = tokio::time::Instant::now();
    let limit = throttle::WorkerLimit::new(settings.max_workers);
    let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::unbounded_channel::<JobOutcome>();
    let mut pool = tokio::task::JoinSet::new();
    let total = jobs.len();
    for job in jobs {
        tracing::info!("submitting: {:?}", &job.source_path);
        let transport = transport.clone();
        let limit = limit.clone();
        let outcome_tx = outcome_tx.clone();
        let job_progress = progress.clone();
        let cancel = cancel.clone();
        let policy = settings.retry;
        pool.spawn(async move {
            let _worker = limit.permit().await;
            let outcome =
                transfer::run_job(&*transport, job, &policy, &job_progress, &cancel).await;
            // the receiver is only gone if the scheduler itself went away
            let _ = outcome_tx.send(outcome);
        });
        progress.jobs_submitted.inc();
    }
    drop(outcome_tx);
    tracing::info!("{} jobs submitted", total);
    let mut summary = Summary {
        jobs: total,
        ..Default::default()
    };
    let mut remaining = total;
    let mut finished_since_report = 0;
    let mut printer = progress::ProgressPrinter::new(&progress);
    let mut ticker = tokio::time::interval(std::cmp::max(
        settings.poll_interval,
        MIN_POLL_INTERVAL,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    while remaining > 0 {
        tokio::select! {
            outcome = outcome_rx.recv() => match outcome {
                Some(outcome) => {
                    remaining -= 1;
                    finished_since_report += 1;
                    progress.jobs_finished.inc();
                    summary.record(&outcome);
                    tracing::debug!(
                        "{:?} {} after {} attempts, {} jobs remaining",
                        &outcome.job.source_path,
                        outcome.status,
                        outcome.attempts,
                        remaining
                    );
                }
                // every sender is gone while jobs are still outstanding
                None => break,
            },
            _ = ticker.tick() => {
                if finished_since_report > 0 {
                    tracing::info!("removed {} finished jobs", finished_since_report);
                    finished_since_report = 0;
                }
                tracing::info!("{} jobs left...", remaining);
                tracing::debug!("\n{}", printer.print());
            }
        }
    }
    while let Some(res) = pool.join_next().await {
        summary.elapsed = start_time.elapsed();
        if let Err(error) = res {
            return Err(Error::new(
                anyhow::Error::new(error).context("sync job task failed"),
                summary,
            ));
        }
    }
    summary.elapsed = start_time.elapsed();
    if summary.unfinished() > 0 {
        return Err(Error::new(
            anyhow!("{} jobs never reported an outcome", summary.unfinished()),
            summary,
        ));
    }
    if summary.abandoned > 0 || summary.cancelled > 0 {
        return Err(Error::new(
            anyhow!(
                "{} of {} jobs did not complete ({} abandoned, {} cancelled)",
                summary.abandoned + summary.cancelled,
                summary.jobs,
                summary.abandoned,
                summary.cancelled
            ),
            summary,
        ));
    }
    tracing::info!("finished.");
    Ok(summary)
}
