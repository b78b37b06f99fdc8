//! Per-invocation timestamp capture

/// Marker for a timestamp that has not been recorded
pub const UNSET: i64 = -1;

/// Timestamps of one operation invocation, in master-adjusted milliseconds.
///
/// `invoke_time` and `respond_time` are stamped by
/// [`DriverContext::record_time`](crate::engine::context::DriverContext::record_time)
/// (either from an instrumented transport or from driver code, depending on
/// the operation's timing mode). `pause_time` is an optional extra stamp for
/// transports that separate connection setup from the timed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    pub invoke_time: i64,
    pub respond_time: i64,
    pub pause_time: i64,
}

impl TimingInfo {
    pub fn unset() -> Self {
        Self {
            invoke_time: UNSET,
            respond_time: UNSET,
            pause_time: UNSET,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::unset();
    }

    /// Response latency, once both stamps are present
    pub fn latency(&self) -> Option<i64> {
        if self.invoke_time == UNSET || self.respond_time == UNSET {
            None
        } else {
            Some(self.respond_time - self.invoke_time)
        }
    }
}

impl Default for TimingInfo {
    fn default() -> Self {
        Self::unset()
    }
}
