//! Monotonic millisecond clock, master-offset adjusted
//!
//! All timing decisions in the harness (invoke times, phase windows, the
//! bench start trigger) are made in *master milliseconds*: the master's
//! monotonic clock, starting near zero at master creation. Agents sample the
//! master clock once at startup and fold the measured offset into their own
//! `Timer`; within one run the drift between hosts is assumed bounded.
//!
//! # Examples
//!
//! ```
//! use drover::util::Timer;
//!
//! let timer = Timer::new();
//! let t0 = timer.now();
//! let t1 = timer.now();
//! assert!(t1 >= t0);
//! ```

use std::time::{Duration, Instant};

/// Monotonic millisecond clock with an adjustable offset
#[derive(Debug, Clone)]
pub struct Timer {
    epoch: Instant,
    offset_ms: i64,
}

impl Timer {
    /// A fresh clock reading zero (plus a few microseconds) right now
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ms: 0,
        }
    }

    /// Current time in master-adjusted milliseconds
    pub fn now(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64 + self.offset_ms
    }

    /// Fold a measured clock offset into this timer.
    ///
    /// Agents call this once after sampling the master clock; see
    /// [`Timer::offset_against`] for the estimation arithmetic.
    pub fn adjust(&mut self, delta_ms: i64) {
        self.offset_ms += delta_ms;
    }

    /// Estimate the offset of this clock against a remote reading.
    ///
    /// `local_before` and `local_after` bracket the remote sample
    /// `remote_now`; the remote reading is assumed to correspond to the
    /// midpoint of the round trip.
    pub fn offset_against(local_before: i64, remote_now: i64, local_after: i64) -> i64 {
        let midpoint = local_before + (local_after - local_before) / 2;
        remote_now - midpoint
    }

    /// Sleep on the OS clock for `ms` milliseconds. Not interruptible;
    /// driver threads use their stop flag's deadline wait instead.
    pub fn sleep(ms: i64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_monotonic() {
        let timer = Timer::new();
        let a = timer.now();
        let b = timer.now();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn test_timer_adjust_shifts_readings() {
        let mut timer = Timer::new();
        let before = timer.now();
        timer.adjust(10_000);
        assert!(timer.now() >= before + 10_000);
    }

    #[test]
    fn test_offset_estimation_uses_midpoint() {
        // Local clock reads 100..120 around a remote sample of 5000: the
        // remote reading corresponds to local 110, so the offset is 4890.
        assert_eq!(Timer::offset_against(100, 5000, 120), 4890);
        // Zero round trip degenerates to a plain difference.
        assert_eq!(Timer::offset_against(100, 5000, 100), 4900);
    }
}
