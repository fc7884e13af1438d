//! Running the external transfer tool for one job
//!
//! [`run_job`] drives a single job through its attempt loop and only returns once the job has
//! reached a final state. A failed attempt is never reported to the caller as an error: it is
//! logged and retried after a backoff, as long as the retry policy allows.

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::job::SyncJob;
use crate::progress;
use crate::retry::{JobState, JobStatus, RetryPolicy};

/// Default per-job I/O timeout handed to the transfer tool, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 90;

/// How the transfer tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Transfer tool executable (`rsync` compatible).
    pub tool: std::path::PathBuf,
    /// Value of `--timeout` passed to every file transfer.
    pub timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tool: std::path::PathBuf::from("rsync"),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Flags shared by every file transfer (the per-job `--partial-dir` is added by the job).
    pub fn transfer_options(&self) -> Vec<String> {
        vec![
            "-a".to_string(),
            "-v".to_string(),
            "--protect-args".to_string(),
            "--partial".to_string(),
            "--progress".to_string(),
            "--stats".to_string(),
            format!("--timeout={}", self.timeout_secs),
        ]
    }
}

/// One invocation of the transfer tool.
///
/// `Ok` means the tool reported success. Any other outcome, including failing to start the
/// tool, is an `Err` describing the failed attempt.
pub trait Transport: Send + Sync + 'static {
    fn run(
        &self,
        args: &[std::ffi::OsString],
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Runs the transfer tool as a child process, sharing this process' stdout and stderr.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: std::path::PathBuf,
}

impl CommandTransport {
    pub fn new(program: impl Into<std::path::PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Transport for CommandTransport {
    async fn run(&self, args: &[std::ffi::OsString]) -> anyhow::Result<()> {
        tracing::debug!("running {:?} {:?}", &self.program, args);
        let status = tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to start {:?}", &self.program))?;
        if !status.success() {
            return Err(anyhow!("{:?} exited with {}", &self.program, status));
        }
        Ok(())
    }
}

/// Final report of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: SyncJob,
    /// Number of times the transfer tool was started.
    pub attempts: u32,
    /// Attempts that ended with the tool reporting failure.
    pub failed_attempts: u32,
    pub status: JobStatus,
}

/// Sleeps for `delay` unless cancelled first; returns `false` on cancellation.
async fn sleep_or_cancel(
    delay: std::time::Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Runs `job` until it succeeds, runs out of attempts or is cancelled.
#[instrument(skip_all, fields(source = ?job.source_path))]
pub async fn run_job<T: Transport>(
    transport: &T,
    job: SyncJob,
    policy: &RetryPolicy,
    progress: &progress::Progress,
    cancel: &tokio_util::sync::CancellationToken,
) -> JobOutcome {
    let args = job.args();
    let mut failed_attempts = 0;
    let mut state = JobState::Pending;
    loop {
        state = match state {
            JobState::Pending => {
                let delay = policy.start_jitter.sample();
                tracing::debug!("first attempt in {:.1}s", delay.as_secs_f64());
                if sleep_or_cancel(delay, cancel).await {
                    JobState::Attempting(1)
                } else {
                    JobState::Done {
                        attempts: 0,
                        status: JobStatus::Cancelled,
                    }
                }
            }
            JobState::Attempting(attempt) => {
                tracing::info!("transferring {:?} (attempt {})", &job.source_path, attempt);
                progress.attempts.inc();
                let result = {
                    let _transfer = progress.transfers.guard();
                    tokio::select! {
                        result = transport.run(&args) => Some(result),
                        _ = cancel.cancelled() => None,
                    }
                };
                match result {
                    Some(Ok(())) => JobState::Done {
                        attempts: attempt,
                        status: JobStatus::Succeeded,
                    },
                    Some(Err(error)) => {
                        failed_attempts += 1;
                        progress.failed_attempts.inc();
                        tracing::warn!(
                            "transfer of {:?} failed (attempt {}): {:#}",
                            &job.source_path,
                            attempt,
                            &error
                        );
                        if policy.allows_retry_after(attempt) {
                            JobState::Backoff(attempt)
                        } else {
                            tracing::error!(
                                "giving up on {:?} after {} attempts",
                                &job.source_path,
                                attempt
                            );
                            JobState::Done {
                                attempts: attempt,
                                status: JobStatus::Abandoned,
                            }
                        }
                    }
                    None => JobState::Done {
                        attempts: attempt,
                        status: JobStatus::Cancelled,
                    },
                }
            }
            JobState::Backoff(attempt) => {
                let delay = policy.backoff.sample();
                tracing::warn!(
                    "restarting transfer of {:?} in {:.1}s",
                    &job.source_path,
                    delay.as_secs_f64()
                );
                if sleep_or_cancel(delay, cancel).await {
                    JobState::Attempting(attempt + 1)
                } else {
                    JobState::Done {
                        attempts: attempt,
                        status: JobStatus::Cancelled,
                    }
                }
            }
            JobState::Done { attempts, status } => {
                tracing::debug!("{:?} {} after {} attempts", &job.source_path, status, attempts);
                return JobOutcome {
                    job,
                    attempts,
                    failed_attempts,
                    status,
                };
            }
        };
        tracing::debug!("state: {:?}", &state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::DelayRange;
    use crate::testutils::{FakeTransport, sample_job};
    use tracing_test::traced_test;

    fn secs(value: f64) -> std::time::Duration {
        std::time::Duration::from_secs_f64(value)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_delay_bounds() {
        let failures = 3;
        let transport = FakeTransport::failing_first(failures);
        let progress = progress::Progress::new();
        let cancel = tokio_util::sync::CancellationToken::new();
        let start = tokio::time::Instant::now();
        let outcome = run_job(
            &transport,
            sample_job("a.txt"),
            &RetryPolicy::default(),
            &progress,
            &cancel,
        )
        .await;
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.attempts, failures + 1);
        assert_eq!(outcome.failed_attempts, failures);
        let calls = transport.call_times();
        assert_eq!(calls.len(), (failures + 1) as usize);
        let first = calls[0] - start;
        assert!(first >= secs(3.0) && first <= secs(7.0), "first delay {first:?}");
        for pair in calls.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= secs(15.0) && gap <= secs(30.0), "backoff {gap:?}");
        }
        assert_eq!(progress.attempts.get(), u64::from(failures + 1));
        assert_eq!(progress.failed_attempts.get(), u64::from(failures));
        assert_eq!(progress.transfers.get().started, progress.transfers.get().finished);
    }

    #[tokio::test(start_paused = true)]
    async fn passes_job_arguments_to_transport() {
        let transport = FakeTransport::failing_first(0);
        let job = sample_job("b.txt");
        let expected = job.args();
        let outcome = run_job(
            &transport,
            job,
            &RetryPolicy::default(),
            &progress::Progress::new(),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls(), vec![expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_abandons() {
        let transport = FakeTransport::always_failing();
        let policy = RetryPolicy::new(
            DelayRange::from_secs(0, 0),
            DelayRange::from_secs(1, 1),
            4,
        );
        let outcome = run_job(
            &transport,
            sample_job("c.txt"),
            &policy,
            &progress::Progress::new(),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.status, JobStatus::Abandoned);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(transport.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let transport = FakeTransport::always_failing();
        let cancel = tokio_util::sync::CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                cancel.cancel();
            })
        };
        let outcome = run_job(
            &transport,
            sample_job("d.txt"),
            &RetryPolicy::default(),
            &progress::Progress::new(),
            &cancel,
        )
        .await;
        canceller.await.unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert!(outcome.attempts >= 2);
        assert_eq!(outcome.failed_attempts, outcome.attempts);
        assert_eq!(transport.calls().len() as u32, outcome.attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_never_runs() {
        let transport = FakeTransport::failing_first(0);
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let outcome = run_job(
            &transport,
            sample_job("e.txt"),
            &RetryPolicy::default(),
            &progress::Progress::new(),
            &cancel,
        )
        .await;
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.attempts, 0);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failures_are_logged() {
        let transport = FakeTransport::failing_first(1);
        run_job(
            &transport,
            sample_job("f.txt"),
            &RetryPolicy::default(),
            &progress::Progress::new(),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await;
        assert!(logs_contain("failed (attempt 1)"));
        assert!(logs_contain("restarting transfer"));
        assert!(logs_contain("(attempt 2)"));
        logs_assert(|lines: &[&str]| {
            let transitions = ["state: Attempting(1)", "state: Backoff(1)", "state: Attempting(2)"];
            for transition in transitions {
                if !lines
                    .iter()
                    .any(|line| line.contains(" DEBUG ") && line.contains(transition))
                {
                    return Err(format!("no DEBUG line for {transition:?}"));
                }
            }
            Ok(())
        });
    }

    #[tokio::test]
    async fn command_transport_reports_exit_status() {
        let ok = CommandTransport::new("true");
        assert!(ok.run(&[]).await.is_ok());
        let failing = CommandTransport::new("false");
        let error = failing.run(&[]).await.unwrap_err();
        assert!(format!("{error:#}").contains("exited with"));
        let missing = CommandTransport::new("/nonexistent/prsync-transfer-tool");
        let error = missing.run(&[]).await.unwrap_err();
        assert!(format!("{error:#}").contains("failed to start"));
    }
}
