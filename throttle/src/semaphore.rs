use std::sync::atomic::{AtomicBool, Ordering};

pub struct Semaphore {
    flag: AtomicBool,
    sem: std::sync::Arc<tokio::sync::Semaphore>,
}

impl Semaphore {
    pub fn new() -> Self {
        let flag = AtomicBool::new(false);
        let sem = std::sync::Arc::new(tokio::sync::Semaphore::new(0));
        Self { flag, sem }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        let value = std::cmp::min(value, tokio::sync::Semaphore::MAX_PERMITS);
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn acquire_owned(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if self.is_enabled() {
            // the semaphore is owned here and never closed
            Some(self.sem.clone().acquire_owned().await.unwrap())
        } else {
            None
        }
    }
}
