//! Cooperative cancellation for driver threads
//!
//! Rust threads cannot be interrupted from outside, so every blocking wait
//! in the engine goes through either a latch (which run termination forces
//! open) or this flag's deadline wait. Setting the flag wakes all sleepers
//! immediately; the woken code checks `is_stopped` and exits its loop.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::util::Timer;

/// Stop signal shared between a driver thread and its terminators
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination and wake every sleeper
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep until `deadline` on the master-adjusted clock.
    ///
    /// Returns `true` when the deadline was reached, `false` when the sleep
    /// was cut short by `stop`. A deadline in the past returns immediately
    /// with `true`.
    pub fn sleep_until(&self, timer: &Timer, deadline: i64) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *stopped {
                return false;
            }
            let remaining = deadline - timer.now();
            if remaining <= 0 {
                return true;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(stopped, Duration::from_millis(remaining as u64))
                .unwrap_or_else(|e| e.into_inner());
            stopped = guard;
        }
    }
}
