use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Level, event, instrument};

#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: Counter,
    finished: Counter,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: Counter::new(),
            finished: Counter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        // read finished first so a concurrent start can only make "started" larger
        let finished = self.finished.get();
        let mut status = Status {
            started: self.started.get(),
            finished,
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Counters shared by the scheduler and all running jobs.
#[derive(Debug)]
pub struct Progress {
    /// Jobs handed to the worker pool.
    pub jobs_submitted: Counter,
    /// Jobs whose outcome reached the scheduler.
    pub jobs_finished: Counter,
    /// Transfer tool processes currently running (started vs exited).
    pub transfers: ProgressCounter,
    pub attempts: Counter,
    pub failed_attempts: Counter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            jobs_submitted: Default::default(),
            jobs_finished: Default::default(),
            transfers: Default::default(),
            attempts: Default::default(),
            failed_attempts: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Jobs submitted but not finished yet.
    pub fn jobs_remaining(&self) -> u64 {
        let finished = self.jobs_finished.get();
        self.jobs_submitted.get().saturating_sub(finished)
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_finished: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_finished: progress.jobs_finished.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let finished = self.progress.jobs_finished.get();
        let transfers = self.progress.transfers.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_rate = rate(finished, total_duration_secs);
        let current_rate = rate(finished.saturating_sub(self.last_finished), curr_duration_secs);
        // update self
        self.last_finished = finished;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            JOBS:\n\
            submitted: {:>10}\n\
            finished:  {:>10}\n\
            remaining: {:>10}\n\
            average:   {:>10.2} jobs/s\n\
            current:   {:>10.2} jobs/s\n\
            -----------------------\n\
            TRANSFERS:\n\
            running:   {:>10}\n\
            attempts:  {:>10}\n\
            failed:    {:>10}",
            self.progress.jobs_submitted.get(),
            finished,
            self.progress.jobs_remaining(),
            average_rate,
            current_rate,
            transfers.started - transfers.finished,
            self.progress.attempts.get(),
            self.progress.failed_attempts.get(),
        )
    }
}

fn rate(count: u64, secs: f64) -> f64 {
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let counter = Counter::new();
        for _ in 0..10 {
            counter.inc();
        }
        assert!(counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let counter = Counter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        counter.inc();
                    }
                });
            }
        });
        assert!(counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn basic_guard() -> Result<()> {
        let progress = ProgressCounter::new();
        {
            let _guard = progress.guard();
            let status = progress.get();
            assert_eq!(status.started - status.finished, 1);
        }
        let status = progress.get();
        assert_eq!(status.started, 1);
        assert_eq!(status.finished, 1);
        Ok(())
    }

    #[test]
    fn remaining_jobs() -> Result<()> {
        let progress = Progress::new();
        progress.jobs_submitted.add(5);
        progress.jobs_finished.add(2);
        assert_eq!(progress.jobs_remaining(), 3);
        let report = ProgressPrinter::new(&progress).print();
        assert!(report.contains("remaining:          3"));
        Ok(())
    }
}
