//! Counting semaphore built on `Mutex` + `Condvar`.
//!
//! Pairs with the ready queue and the submission queue: one permit per
//! queued item. The timed acquire is what gives the I/O submitter its batch
//! flush cadence.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Try to take a permit within `timeout`. Returns `false` on timeout.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cv.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Add `n` permits and wake that many waiters.
    pub fn release(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert!(!sem.try_acquire_for(Duration::from_millis(10)));
        sem.release(1);
        assert!(sem.try_acquire_for(Duration::from_millis(10)));
    }

    #[test]
    fn test_release_wakes_blocked_acquire() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                sem.acquire();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        sem.release(1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_timed_acquire_times_out() {
        let sem = Semaphore::new(0);
        let start = std::time::Instant::now();
        assert!(!sem.try_acquire_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
