//! Pacing capability: when to invoke next, when the workload is done
//!
//! The driver thread owns its loop; a `Pacer` owns the phase logic. The
//! next-invoke computation is shared (it only depends on the governing
//! cycle's discipline), while the termination test and the presence of a
//! background clock distinguish the three workload shapes: time-bounded,
//! time-bounded with background, and cycle-bounded.

use crate::engine::cycle::{Cycle, CycleType};

/// Virtual clock of one mix slot
#[derive(Debug, Clone, Copy)]
pub struct SlotClock {
    /// Start of the last invocation, master ms
    pub start_time: i64,
    /// End of the last invocation, master ms
    pub end_time: i64,
}

impl SlotClock {
    /// Both clocks begin at the bench start trigger
    pub fn at(bench_start: i64) -> Self {
        Self {
            start_time: bench_start,
            end_time: bench_start,
        }
    }
}

/// Phase logic for one driver thread
pub trait Pacer: Send {
    /// Absolute next invoke time given the governing cycle and a drawn
    /// delay: cycle time paces start-to-start, think time end-to-start.
    fn next_invoke(&self, clock: &SlotClock, cycle: &Cycle, delay_ms: i64) -> i64 {
        match cycle.kind {
            CycleType::CycleTime => clock.start_time + delay_ms,
            CycleType::ThinkTime => clock.end_time + delay_ms,
        }
    }

    /// Termination test, evaluated once per completed operation
    fn done(&self, now_ms: i64, foreground_cycles: u64) -> bool;

    /// Whether this workload runs the background mix slot
    fn has_background(&self) -> bool {
        false
    }
}

/// Ends when wall time passes the end of ramp-down
pub struct TimePacer {
    pub run_end: i64,
}

impl Pacer for TimePacer {
    fn done(&self, now_ms: i64, _foreground_cycles: u64) -> bool {
        now_ms >= self.run_end
    }
}

/// Time-bounded with an independent background clock in the same thread
pub struct TimeWithBackgroundPacer {
    pub run_end: i64,
}

impl Pacer for TimeWithBackgroundPacer {
    fn done(&self, now_ms: i64, _foreground_cycles: u64) -> bool {
        now_ms >= self.run_end
    }

    fn has_background(&self) -> bool {
        true
    }
}

/// Ends after a fixed number of foreground cycles
pub struct CyclePacer {
    pub limit: u64,
}

impl Pacer for CyclePacer {
    fn done(&self, _now_ms: i64, foreground_cycles: u64) -> bool {
        foreground_cycles >= self.limit
    }
}
