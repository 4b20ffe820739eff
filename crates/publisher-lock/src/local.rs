use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::{BucketLock, LockError};

/// Lock that always succeeds, for runs with locking disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

impl NoopLock {
    pub fn new() -> Self {
        Self
    }
}

impl BucketLock for NoopLock {
    fn lock(&self) -> Result<(), LockError> {
        debug!("locking disabled");
        Ok(())
    }

    fn release(&self) -> Result<(), LockError> {
        Ok(())
    }
}

/// Process-local lock. Fails immediately when held; never polls.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    locked: AtomicBool,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl BucketLock for InMemoryLock {
    fn lock(&self) -> Result<(), LockError> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    fn release(&self) -> Result<(), LockError> {
        self.locked.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn noop_lock_never_blocks() {
        let lock = NoopLock::new();
        lock.lock().unwrap();
        lock.lock().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn in_memory_lock_is_exclusive() {
        let lock = InMemoryLock::new();
        lock.lock().unwrap();
        assert!(lock.is_locked());
        assert!(matches!(lock.lock(), Err(LockError::Busy)));
        lock.release().unwrap();
        lock.lock().unwrap();
    }

    #[test]
    fn in_memory_lock_admits_one_thread() {
        let lock = Arc::new(InMemoryLock::new());
        let winners: usize = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || lock.lock().is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
