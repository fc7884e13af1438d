//! Concurrency limiting for sync jobs
//!
//! Every sync job opens its own network connection through an external transfer tool. Starting
//! all of them at once would exhaust file descriptors and connection slots on both ends, so jobs
//! must hold a worker slot while they run.
//!
//! # Overview
//!
//! [`WorkerLimit`] is a cloneable handle to a shared pool of worker slots. A job calls
//! [`WorkerLimit::permit`] before doing any work and keeps the returned [`WorkerGuard`] alive
//! until it is done; dropping the guard frees the slot for the next queued job.
//!
//! A limit of `0` disables the bound entirely: permits are granted immediately and nothing is
//! tracked.
//!
//! ```rust,no_run
//! use throttle::WorkerLimit;
//!
//! # async fn example() {
//! let limit = WorkerLimit::new(25);
//! let mut join_set = tokio::task::JoinSet::new();
//! for _ in 0..100 {
//!     let limit = limit.clone();
//!     join_set.spawn(async move {
//!         let _guard = limit.permit().await;
//!         // at most 25 of these run here at the same time
//!     });
//! }
//! while join_set.join_next().await.is_some() {}
//! # }
//! ```
//!
//! # Fairness
//!
//! Slots are handed out in the order jobs started waiting for them (tokio semaphores are
//! fair), so jobs submitted first start first. No ordering is guaranteed for completion.

mod semaphore;

/// Shared pool of worker slots.
#[derive(Clone)]
pub struct WorkerLimit {
    max_workers: usize,
    sem: std::sync::Arc<semaphore::Semaphore>,
}

impl std::fmt::Debug for WorkerLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLimit")
            .field("max_workers", &self.max_workers)
            .field("available", &self.available())
            .finish()
    }
}

/// Holds one worker slot until dropped.
pub struct WorkerGuard {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl WorkerLimit {
    /// Creates a pool of `max_workers` slots, `0` means no limit.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        let sem = semaphore::Semaphore::new();
        sem.setup(max_workers);
        if max_workers == 0 {
            tracing::debug!("worker limit disabled");
        }
        Self {
            max_workers,
            sem: std::sync::Arc::new(sem),
        }
    }

    /// Configured number of slots (`0` when unbounded).
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of free slots, `None` when the limit is disabled.
    #[must_use]
    pub fn available(&self) -> Option<usize> {
        if self.sem.is_enabled() {
            Some(self.sem.available_permits())
        } else {
            None
        }
    }

    /// Waits for a free slot.
    pub async fn permit(&self) -> WorkerGuard {
        WorkerGuard {
            _permit: self.sem.acquire_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded() {
        let limit = WorkerLimit::new(2);
        assert_eq!(limit.available(), Some(2));
        let first = limit.permit().await;
        let _second = limit.permit().await;
        assert_eq!(limit.available(), Some(0));
        let waiting = {
            let limit = limit.clone();
            tokio::spawn(async move {
                let _third = limit.permit().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        drop(first);
        waiting.await.unwrap();
        assert_eq!(limit.available(), Some(1));
    }

    #[tokio::test]
    async fn zero_means_unbounded() {
        let limit = WorkerLimit::new(0);
        assert_eq!(limit.available(), None);
        let mut guards = Vec::new();
        for _ in 0..1000 {
            guards.push(limit.permit().await);
        }
        assert_eq!(limit.max_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let limit = WorkerLimit::new(3);
        let running = std::sync::Arc::new(AtomicUsize::new(0));
        let peak = std::sync::Arc::new(AtomicUsize::new(0));
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let limit = limit.clone();
            let running = running.clone();
            let peak = peak.clone();
            join_set.spawn(async move {
                let _guard = limit.permit().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(res) = join_set.join_next().await {
            res.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limit.available(), Some(3));
    }
}
