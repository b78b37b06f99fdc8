//! On-disk queue layout and the process-wide queue lock
//!
//! Layout under one base directory:
//!
//! ```text
//! <base>/queue/<runId>/     pending runs, one directory each
//! <base>/active/<runId>/    the single run being executed
//! <base>/output/<runId>/    archived runs with their reports
//! <base>/sequence           next token to mint, "<int>:<char>"
//! <base>/queue.lock         advisory lockfile
//! ```
//!
//! Every structural mutation of the queue happens inside `with_lock`, which
//! holds an exclusive `flock` on the lockfile. The lock works across
//! processes and across threads in one process (each acquisition opens its
//! own file description) and is released on every exit path by the guard's
//! `Drop`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::QueueError;
use crate::runq::sequence::{self, SequenceToken};

/// Directory layout plus lock and token accessors
#[derive(Debug, Clone)]
pub struct QueueStore {
    base: PathBuf,
}

impl QueueStore {
    /// Open (creating as needed) the store under `base`
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let store = Self { base: base.into() };
        std::fs::create_dir_all(store.queue_dir())?;
        std::fs::create_dir_all(store.active_dir())?;
        std::fs::create_dir_all(store.output_dir())?;
        Ok(store)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.base.join("queue")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.base.join("active")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base.join("output")
    }

    pub fn sequence_path(&self) -> PathBuf {
        self.base.join("sequence")
    }

    fn lock_path(&self) -> PathBuf {
        self.base.join("queue.lock")
    }

    /// Run `f` under the exclusive queue lock. The lock is released when
    /// the guard drops, whether `f` succeeds or fails.
    pub fn with_lock<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let _guard = FileLock::acquire(&self.lock_path())?;
        f(self)
    }

    pub fn read_token(&self) -> SequenceToken {
        sequence::load(&self.sequence_path())
    }

    pub fn write_token(&self, token: SequenceToken) -> Result<(), QueueError> {
        sequence::store(&self.sequence_path(), token)?;
        Ok(())
    }

    /// Whether a run directory exists anywhere in the lifecycle
    pub fn run_exists(&self, run_id: &str) -> bool {
        self.queue_dir().join(run_id).is_dir()
            || self.active_dir().join(run_id).is_dir()
            || self.output_dir().join(run_id).is_dir()
    }
}

/// Exclusive advisory lock on a file, held for the guard's lifetime
struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            loop {
                let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if rc == 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(QueueError::Lock(err.to_string()));
                }
            }
        }
        Ok(Self { file })
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
