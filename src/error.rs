/// Harness errors with specific handling for different failure modes
///
/// This module provides the error vocabulary shared by the run queue, the
/// master/agent coordination plane, and driver code:
/// - Queue errors (lock, sequence file, directory I/O)
/// - Run errors (fatal driver failures, timing validation, trigger expiry)
/// - Transport errors (master or agent unreachable)
/// - Driver errors (the split between "abort the run" and "count as failed")
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// RPC-layer failure between master and agents.
///
/// The in-process transport never produces these, but the coordination code
/// is written against the possibility: the master retries a failed call once
/// and aborts the run on the second failure.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// An agent did not respond
    #[error("agent {0} unreachable: {1}")]
    AgentUnreachable(usize, String),

    /// An agent responded but could not carry out the request
    #[error("agent {0} failed: {1}")]
    AgentFailed(usize, String),

    /// The master did not respond
    #[error("master unreachable: {0}")]
    MasterUnreachable(String),
}

/// Errors surfaced by the run queue and its daemon
#[derive(Error, Debug)]
pub enum QueueError {
    /// Underlying filesystem failure
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The queue lockfile could not be acquired
    #[error("failed to acquire queue lock: {0}")]
    Lock(String),

    /// The submitted parameter repository is unusable
    #[error("invalid benchmark configuration: {0}")]
    BadConfig(String),

    /// A run id was not found where the operation expected it
    #[error("run '{0}' not found")]
    RunNotFound(String),
}

/// A driver-raised or core-raised condition that must abort the whole run.
///
/// Carries a `logged` flag so the error is reported exactly once as it
/// unwinds through the driver thread, the agent, and the master.
#[derive(Debug)]
pub struct FatalError {
    source: anyhow::Error,
    logged: AtomicBool,
}

impl FatalError {
    pub fn new(source: anyhow::Error) -> Self {
        Self {
            source,
            logged: AtomicBool::new(false),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(anyhow::anyhow!(message.into()))
    }

    /// Mark the error as logged. Returns `true` if it had already been
    /// logged, in which case the caller must not log it again.
    pub fn mark_logged(&self) -> bool {
        self.logged.swap(true, Ordering::Relaxed)
    }

    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl std::error::Error for FatalError {}

/// Outcome of a single driver operation, as seen by the driver thread.
///
/// The variant decides run fate: `Fatal` aborts the whole run, `Failed` is
/// counted against the operation (when it lands in steady state) and the
/// thread continues, `Interrupted` exits cleanly when the thread has been
/// stopped and is re-wrapped as fatal otherwise.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The run cannot continue
    #[error("fatal driver error: {0}")]
    Fatal(FatalError),

    /// This operation failed; the run goes on
    #[error("operation failed: {0:#}")]
    Failed(anyhow::Error),

    /// A blocking call was cut short by run termination
    #[error("operation interrupted")]
    Interrupted,
}

impl DriverError {
    /// Wrap an arbitrary error as fatal
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        DriverError::Fatal(FatalError::new(err.into()))
    }

    /// Wrap an arbitrary error as an ordinary operation failure
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        DriverError::Failed(err.into())
    }
}

/// Errors terminating a driver thread or an entire run
#[derive(Error, Debug)]
pub enum RunError {
    /// Fatal driver or validation error, already classified
    #[error("{0}")]
    Fatal(FatalError),

    /// The agent woke after the bench start time had already passed
    #[error("{0}")]
    TriggerExpired(String),

    /// Master/agent RPC failed beyond the retry budget
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The run configuration is not executable
    #[error("run configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_logged_flag_latches() {
        let err = FatalError::msg("boom");
        assert!(!err.mark_logged(), "first mark reports not-yet-logged");
        assert!(err.mark_logged(), "second mark reports already-logged");
        assert!(err.mark_logged());
    }

    #[test]
    fn test_driver_error_display() {
        let e = DriverError::failed(anyhow::anyhow!("connection reset"));
        assert!(e.to_string().contains("connection reset"));

        let e = DriverError::fatal(anyhow::anyhow!("schema mismatch"));
        assert!(e.to_string().contains("schema mismatch"));
    }
}
