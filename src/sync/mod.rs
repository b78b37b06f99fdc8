//! Blocking coordination primitives for the thread-per-virtual-user engine
//!
//! Three primitives cover every suspension point in a run: a count-down
//! latch for the start/pre-run/post-run barriers, a monotonic state cell for
//! observing driver-thread lifecycle, and a stop flag whose deadline wait
//! doubles as the interruptible sleep-to-invoke.

pub mod latch;
pub mod state;
pub mod stop;

pub use latch::CountDownLatch;
pub use state::StateCell;
pub use stop::StopFlag;
