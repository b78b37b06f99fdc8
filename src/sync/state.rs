//! Monotonic state observation without polling
//!
//! A `StateCell` holds an ordered state value that only ever moves forward.
//! Observers block in `wait_for` until the state reaches (or passes) the one
//! they care about; every transition broadcasts to all waiters.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// An observable, forward-only state value
#[derive(Debug)]
pub struct StateCell<S: Copy + Ord> {
    state: Mutex<S>,
    cv: Condvar,
}

impl<S: Copy + Ord> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Current state
    pub fn get(&self) -> S {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, waking all observers. Attempts to move backwards are
    /// ignored, which keeps the cell monotonic under races between the
    /// owning thread and a terminator.
    pub fn advance(&self, next: S) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if next > *state {
            *state = next;
            self.cv.notify_all();
        }
    }

    /// Block until the state is `>= target`
    pub fn wait_for(&self, target: S) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state < target {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the state is `>= target` or the timeout elapses.
    /// Returns `true` if the target was reached.
    pub fn wait_for_timeout(&self, target: S, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_advance_is_monotonic() {
        let cell = StateCell::new(1u8);
        cell.advance(3);
        cell.advance(2); // ignored
        assert_eq!(cell.get(), 3);
    }

    #[test]
    fn test_wait_for_passes_on_overshoot() {
        let cell = Arc::new(StateCell::new(0u8));
        let observer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.wait_for(2))
        };
        // Jumping straight past the target must still release the waiter.
        std::thread::sleep(Duration::from_millis(10));
        cell.advance(4);
        observer.join().unwrap();
    }

    #[test]
    fn test_wait_for_timeout_reports_miss() {
        let cell = StateCell::new(0u8);
        assert!(!cell.wait_for_timeout(1, Duration::from_millis(10)));
        cell.advance(1);
        assert!(cell.wait_for_timeout(1, Duration::from_millis(10)));
    }
}
