//! The run queue: admission, sequencing, and single-run execution
//!
//! Submitted runs live as directories in a queue; a sequence token file
//! mints their ids; a single long-running daemon moves the oldest run into
//! the active slot, executes it through the master, and archives it with
//! its report.

pub mod daemon;
pub mod queue;
pub mod sequence;
pub mod store;

pub use daemon::{DaemonHandle, RunDaemon};
pub use queue::{QueueEntry, RunQueue};
pub use sequence::SequenceToken;
pub use store::QueueStore;
