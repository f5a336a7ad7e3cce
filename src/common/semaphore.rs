//! Counting semaphore for write permits.
//!
//! Every writer into the memory arena first takes one permit per block it
//! may fill. The semaphore is sized to the arena, so the blocks promised to
//! in-flight writers never exceed what eviction can hand back.

use parking_lot::{Condvar, Mutex};

/// A blocking counting semaphore.
pub struct Semaphore {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl Semaphore {
    /// Create a semaphore holding `capacity` permits.
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            released: Condvar::new(),
            capacity,
        }
    }

    /// Block until `count` permits are free, then take them.
    ///
    /// Requests above capacity are clamped so they cannot wait forever.
    pub fn acquire(&self, count: usize) -> Permits<'_> {
        let count = count.min(self.capacity);
        let mut available = self.available.lock();
        while *available < count {
            self.released.wait(&mut available);
        }
        *available -= count;
        Permits {
            semaphore: self,
            count,
        }
    }

    /// Take `count` permits only if they are free right now.
    pub fn try_acquire(&self, count: usize) -> Option<Permits<'_>> {
        let count = count.min(self.capacity);
        let mut available = self.available.lock();
        if *available < count {
            return None;
        }
        *available -= count;
        Some(Permits {
            semaphore: self,
            count,
        })
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        *self.available.lock() += count;
        self.released.notify_all();
    }
}

/// Permits held by a caller, returned when dropped.
pub struct Permits<'a> {
    semaphore: &'a Semaphore,
    count: usize,
}

impl Permits<'_> {
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for Permits<'_> {
    fn drop(&mut self) {
        self.semaphore.release(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(4);
        {
            let permits = sem.acquire(3);
            assert_eq!(permits.count(), 3);
            assert_eq!(sem.available(), 1);
            assert!(sem.try_acquire(2).is_none());
        }
        assert_eq!(sem.available(), 4);
    }

    #[test]
    fn test_oversized_request_clamped() {
        let sem = Semaphore::new(2);
        let permits = sem.acquire(10);
        assert_eq!(permits.count(), 2);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(1));
        let held = sem.acquire(1);

        let sem_clone = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            let _permits = sem_clone.acquire(1);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(held);
        handle.join().unwrap();
        assert_eq!(sem.available(), 1);
    }
}
