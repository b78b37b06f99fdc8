//! Per-thread state exposed to user operation code
//!
//! Every driver thread owns one `DriverContext` and lends it to the driver
//! for the duration of each operation. The context is where timing stamps
//! land (`record_time`), where drivers learn what they are being asked to do
//! (`operation_name`, `operation_id`) and whether the run is measuring
//! (`is_steady_state`), and where the thread's random stream lives so that
//! driver draws and pacing draws share one reproducible sequence.

use rand::rngs::StdRng;
use std::sync::Arc;

use crate::config::RunInfo;
use crate::engine::timing::{TimingInfo, UNSET};
use crate::util::Timer;

/// Per-thread driver-visible state
pub struct DriverContext {
    agent_id: usize,
    thread_id: usize,
    info: Arc<RunInfo>,
    timer: Timer,
    rng: StdRng,
    timing: TimingInfo,
    current_op: usize,
    in_ramp: bool,
}

impl DriverContext {
    pub(crate) fn new(
        agent_id: usize,
        thread_id: usize,
        info: Arc<RunInfo>,
        timer: Timer,
        rng: StdRng,
    ) -> Self {
        Self {
            agent_id,
            thread_id,
            info,
            timer,
            rng,
            timing: TimingInfo::unset(),
            current_op: 0,
            in_ramp: true,
        }
    }

    /// Stamp the current master-adjusted time.
    ///
    /// The first call within an operation sets the invoke time, the second
    /// sets the respond time, and any further call replaces the respond
    /// time, which is what a retrying transport wants.
    pub fn record_time(&mut self) {
        let now = self.timer.now();
        if self.timing.invoke_time == UNSET {
            self.timing.invoke_time = now;
        } else {
            self.timing.respond_time = now;
        }
    }

    /// Stamp the start of an intended pause (connection reuse idle, etc.).
    /// Purely informational; the report does not aggregate it.
    pub fn record_pause(&mut self) {
        self.timing.pause_time = self.timer.now();
    }

    /// Whether the thread currently believes it is inside the measured
    /// window (flips after the first operation that starts in steady state,
    /// and back once ramp-down begins)
    pub fn is_steady_state(&self) -> bool {
        !self.in_ramp
    }

    /// Whether `[start, end]` lies entirely inside the measured window
    pub fn is_steady_window(&self, start: i64, end: i64) -> bool {
        self.info.in_steady(start, end)
    }

    /// Index of the operation being invoked
    pub fn operation_id(&self) -> usize {
        self.current_op
    }

    /// Name of the operation being invoked
    pub fn operation_name(&self) -> &str {
        &self.info.config.driver.operations[self.current_op].name
    }

    pub fn driver_name(&self) -> &str {
        &self.info.config.driver.name
    }

    pub fn agent_id(&self) -> usize {
        self.agent_id
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Current master-adjusted time in ms
    pub fn now(&self) -> i64 {
        self.timer.now()
    }

    /// The thread's random stream, shared with the pacing draws
    pub fn random(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    // -- engine-side API ----------------------------------------------------

    pub(crate) fn begin_operation(&mut self, op: usize) {
        self.current_op = op;
        self.timing.reset();
    }

    pub(crate) fn timing(&self) -> &TimingInfo {
        &self.timing
    }

    pub(crate) fn set_in_ramp(&mut self, in_ramp: bool) {
        self.in_ramp = in_ramp;
    }
}
