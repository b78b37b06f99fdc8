//! Count-down latch over `Mutex`/`Condvar`
//!
//! Used for the three run barriers: the time-set latch (count 1, released by
//! the master once the bench start time is broadcast), the pre-run latch
//! (count 1, released by thread 0 after the once-before hook) and the
//! post-run latch (count = thread count, each thread counts down when its
//! workload ends).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot barrier that opens when its count reaches zero
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// Decrement the count, waking all waiters when it reaches zero.
    /// Counting down an open latch is a no-op.
    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cv.notify_all();
            }
        }
    }

    /// Force the latch open regardless of its count. Run termination uses
    /// this to wake threads still blocked on a start barrier; the woken
    /// thread must check its stop flag afterwards.
    pub fn open(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = 0;
        self.cv.notify_all();
    }

    /// Block until the latch opens
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.cv.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the latch opens or the timeout elapses.
    /// Returns `true` if the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
        true
    }

    /// Current count, for diagnostics
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_latch_opens_at_zero() {
        let latch = CountDownLatch::new(2);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.count_down();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
        // Open latches never close again.
        latch.count_down();
        latch.wait();
    }

    #[test]
    fn test_latch_releases_blocked_waiter() {
        let latch = Arc::new(CountDownLatch::new(1));
        let waiter = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        latch.count_down();
        waiter.join().unwrap();
    }

    #[test]
    fn test_open_forces_release() {
        let latch = CountDownLatch::new(5);
        latch.open();
        assert!(latch.wait_timeout(Duration::from_millis(1)));
        assert_eq!(latch.count(), 0);
    }
}
