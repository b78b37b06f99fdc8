// DROVER - Distributed load-generation harness
// Queued benchmark runs, master/agent coordination, paced driver threads

pub mod config;
pub mod engine;
pub mod error;
pub mod runq;
pub mod sync;
pub mod util;

// Re-exports for convenience
pub use config::{RunConfig, RunControl, RunInfo};
pub use engine::driver::{Driver, DriverFactory, DriverRegistry};
pub use engine::master::{Master, MasterServices, RunResult};
pub use error::{DriverError, QueueError, RunError};
pub use runq::daemon::{DaemonHandle, RunDaemon};
pub use runq::queue::RunQueue;
pub use runq::store::QueueStore;

/// Current DROVER version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
