//! Retry policy for per-file transfers
//!
//! A job waits a short random delay before its first attempt so that jobs submitted together do
//! not all connect at the same instant. After a failed attempt it waits a longer random delay
//! before trying again. By default it never gives up; `max_attempts` bounds the number of
//! attempts for callers that need one.

use anyhow::{Context, anyhow};
use rand::Rng;

/// Closed interval of delays, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    min: std::time::Duration,
    max: std::time::Duration,
}

impl DelayRange {
    /// Fails when `min > max`.
    pub fn new(min: std::time::Duration, max: std::time::Duration) -> anyhow::Result<Self> {
        if min > max {
            return Err(anyhow!(
                "invalid delay range: {} is greater than {}",
                humantime::format_duration(min),
                humantime::format_duration(max)
            ));
        }
        Ok(Self { min, max })
    }

    /// Range of whole seconds, used for the built-in defaults.
    pub const fn from_secs(min: u64, max: u64) -> Self {
        assert!(min <= max);
        Self {
            min: std::time::Duration::from_secs(min),
            max: std::time::Duration::from_secs(max),
        }
    }

    pub fn min(&self) -> std::time::Duration {
        self.min
    }

    pub fn max(&self) -> std::time::Duration {
        self.max
    }

    pub fn sample(&self) -> std::time::Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl std::fmt::Display for DelayRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..{}",
            humantime::format_duration(self.min),
            humantime::format_duration(self.max)
        )
    }
}

impl std::str::FromStr for DelayRange {
    type Err = anyhow::Error;

    /// Accepts `MIN..MAX` (e.g. "15s..30s", "500ms..2s") or a single fixed delay ("10s").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (min, max) = match s.split_once("..") {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (s, s),
        };
        let min = humantime::parse_duration(min)
            .with_context(|| format!("invalid delay {min:?} in range {s:?}"))?;
        let max = humantime::parse_duration(max)
            .with_context(|| format!("invalid delay {max:?} in range {s:?}"))?;
        Self::new(min, max)
    }
}

/// Delay before the first attempt of every job.
pub const DEFAULT_START_JITTER: DelayRange = DelayRange::from_secs(3, 7);
/// Delay between a failed attempt and the next one.
pub const DEFAULT_RETRY_BACKOFF: DelayRange = DelayRange::from_secs(15, 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub start_jitter: DelayRange,
    pub backoff: DelayRange,
    /// `None` retries forever.
    pub max_attempts: Option<std::num::NonZeroU32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            start_jitter: DEFAULT_START_JITTER,
            backoff: DEFAULT_RETRY_BACKOFF,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Builds the policy from the command-line form where `0` attempts means unlimited.
    pub fn new(start_jitter: DelayRange, backoff: DelayRange, max_attempts: u32) -> Self {
        Self {
            start_jitter,
            backoff,
            max_attempts: std::num::NonZeroU32::new(max_attempts),
        }
    }

    /// Whether a job that just finished attempt number `attempt` (1-based) may try again.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max.get(),
            None => true,
        }
    }
}

/// Final state of a job as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    /// Ran out of attempts under a bounded policy.
    Abandoned,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Abandoned => "abandoned",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Where a job is in its attempt loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Submitted, waiting out the start jitter.
    Pending,
    /// Running attempt `n` (1-based).
    Attempting(u32),
    /// Attempt `n` failed, waiting before attempt `n + 1`.
    Backoff(u32),
    Done { attempts: u32, status: JobStatus },
}
