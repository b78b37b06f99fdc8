//! The run daemon: single-writer execution of queued runs
//!
//! One long-running worker thread drains the queue. Each pass it takes the
//! queue lock just long enough to pick the pending run whose sequence
//! suffix sorts smallest and move its directory into the active slot; the
//! lock is released before the (long) execution begins, so submissions keep
//! flowing while a run is in flight. At most one run executes at a time.
//!
//! Wakeups arrive on a channel (`DaemonHandle::wake`, signalled by `add`)
//! with a polling interval as the fallback. A kill requests the in-flight
//! run's master to abort, either through the in-process handle or through a
//! `.kill` marker dropped into the active run directory by another process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::engine::agent::LocalAgentFactory;
use crate::engine::driver::DriverRegistry;
use crate::engine::master::Master;
use crate::error::QueueError;
use crate::runq::queue::scan_queue;
use crate::runq::sequence::split_run_id;
use crate::runq::store::QueueStore;

/// Marker file that asks a foreign daemon process to stop
pub const STOP_MARKER: &str = "daemon.stop";
/// Marker file that asks the daemon to kill the run it sits in
pub const KILL_MARKER: &str = ".kill";

struct CurrentRun {
    run_id: String,
    master: Master,
}

struct DaemonShared {
    current: Mutex<Option<CurrentRun>>,
    exit: AtomicBool,
}

/// Control surface over a started daemon
pub struct DaemonHandle {
    shared: Arc<DaemonShared>,
    wake_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Nudge the daemon to look at the queue now instead of at the next
    /// poll tick
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Id of the run currently executing, if any
    pub fn current_run_id(&self) -> Option<String> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|run| run.run_id.clone())
    }

    /// Abort the in-flight run iff its id matches. Returns whether a kill
    /// was issued.
    pub fn kill_current(&self, run_id: &str) -> bool {
        let current = self
            .shared
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(run) if run.run_id == run_id => {
                warn!(run_id, "killing current run");
                run.master.kill();
                true
            }
            _ => false,
        }
    }

    /// Stop the daemon after the current run completes and wait for it
    pub fn exit(mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Block until the daemon thread exits on its own (stop marker)
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// The single long-running queue worker
pub struct RunDaemon;

impl RunDaemon {
    pub fn start(
        store: QueueStore,
        registry: Arc<DriverRegistry>,
        shutting_down: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<DaemonHandle, QueueError> {
        let (wake_tx, wake_rx) = bounded(1);
        let shared = Arc::new(DaemonShared {
            current: Mutex::new(None),
            exit: AtomicBool::new(false),
        });
        let loop_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("run-daemon".to_string())
            .spawn(move || {
                daemon_loop(
                    store,
                    registry,
                    shutting_down,
                    poll_interval,
                    loop_shared,
                    wake_rx,
                );
            })
            .map_err(|e| QueueError::Lock(format!("daemon thread spawn failed: {}", e)))?;
        Ok(DaemonHandle {
            shared,
            wake_tx,
            join: Some(join),
        })
    }
}

fn daemon_loop(
    store: QueueStore,
    registry: Arc<DriverRegistry>,
    shutting_down: Arc<AtomicBool>,
    poll_interval: Duration,
    shared: Arc<DaemonShared>,
    wake_rx: Receiver<()>,
) {
    info!(base = %store.base().display(), "run daemon started");
    loop {
        if shared.exit.load(Ordering::SeqCst) || shutting_down.load(Ordering::SeqCst) {
            break;
        }
        let stop_marker = store.base().join(STOP_MARKER);
        if stop_marker.exists() {
            let _ = std::fs::remove_file(&stop_marker);
            info!("stop marker found; daemon exiting");
            break;
        }

        match pick_next(&store) {
            Ok(Some(run_id)) => {
                execute_run(&store, &registry, &shared, &shutting_down, &run_id);
            }
            Ok(None) => match wake_rx.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            },
            Err(e) => {
                error!("queue scan failed: {}", e);
                std::thread::sleep(poll_interval);
            }
        }
    }
    info!("run daemon stopped");
}

/// Under the queue lock, pick the oldest pending run (smallest sequence
/// suffix) and move it into the active slot
pub(crate) fn pick_next(store: &QueueStore) -> Result<Option<String>, QueueError> {
    store.with_lock(|store| {
        let entries = scan_queue(store)?;
        let Some(next) = entries.into_iter().next() else {
            return Ok(None);
        };
        let from = store.queue_dir().join(&next.run_id);
        let to = store.active_dir().join(&next.run_id);
        std::fs::rename(&from, &to)?;
        Ok(Some(next.run_id))
    })
}

fn execute_run(
    store: &QueueStore,
    registry: &DriverRegistry,
    shared: &DaemonShared,
    shutting_down: &Arc<AtomicBool>,
    run_id: &str,
) {
    info!(run_id, "run picked for execution");
    let dir = store.active_dir().join(run_id);

    let outcome = run_in_dir(registry, shared, shutting_down, run_id, &dir);
    *shared.current.lock().unwrap_or_else(|e| e.into_inner()) = None;

    match &outcome {
        Ok(aborted) => info!(run_id, aborted = *aborted, "run archived"),
        Err(e) => {
            error!(run_id, "run failed: {:#}", e);
            let _ = std::fs::write(dir.join("FAILED"), format!("{:#}\n", e));
        }
    }

    // Archive regardless of outcome; a failed run leaves its FAILED note.
    let dest = store.output_dir().join(run_id);
    if let Err(e) = std::fs::rename(&dir, &dest) {
        error!(run_id, "could not archive run directory: {}", e);
    }
}

fn run_in_dir(
    registry: &DriverRegistry,
    shared: &DaemonShared,
    shutting_down: &Arc<AtomicBool>,
    run_id: &str,
    dir: &Path,
) -> anyhow::Result<bool> {
    let bench = split_run_id(run_id)
        .map(|(bench, _)| bench.to_string())
        .ok_or_else(|| anyhow::anyhow!("malformed run id '{}'", run_id))?;
    let config = RunConfig::load(&dir.join(format!("{}.toml", bench)))?;
    let driver_factory = registry.get(&config.driver.name).ok_or_else(|| {
        anyhow::anyhow!(
            "no driver registered for '{}' (have: {})",
            config.driver.name,
            registry.names().join(", ")
        )
    })?;

    let master = Master::new();
    *shared.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(CurrentRun {
        run_id: run_id.to_string(),
        master: master.clone(),
    });

    // Cross-process kill: watch for the marker file while the run executes.
    // Dropping `done_tx` disconnects the channel and retires the watcher.
    let (done_tx, done_rx) = bounded::<()>(0);
    {
        let master = master.clone();
        let kill_marker = dir.join(KILL_MARKER);
        let run_id = run_id.to_string();
        std::thread::Builder::new()
            .name("kill-watch".to_string())
            .spawn(move || loop {
                match done_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if kill_marker.exists() {
                            warn!(run_id = %run_id, "kill marker found; aborting run");
                            master.kill();
                            break;
                        }
                    }
                }
            })
            .ok();
    }

    let agent_factory = LocalAgentFactory::with_shutdown_flag(
        driver_factory,
        Arc::clone(shutting_down),
    );
    master.start_run(run_id, config, &agent_factory)?;
    let result = master.join_run()?;
    drop(done_tx);

    if let Err(e) = result.write_report(dir) {
        error!(run_id, "report writing failed: {:#}", e);
    }
    Ok(result.aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runq::queue::RunQueue;
    use crate::runq::sequence::SequenceToken;

    fn seeded_queue() -> (tempfile::TempDir, RunQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("data")).unwrap();
        let queue = RunQueue::new(store);

        let params = dir.path().join("params.toml");
        std::fs::write(
            &params,
            r#"
            [benchmark]
            short_name = "X"

            [run]
            steady_state = 10

            [driver]
            name = "unit"
            threads = 1

            [[driver.operations]]
            name = "ping"
            cycle = { dist = "fixed", ms = 100 }

            [driver.foreground]
            mix = { type = "flat", weights = [1.0] }
            "#,
        )
        .unwrap();

        queue.store().write_token(SequenceToken::FIRST).unwrap();
        queue.add("tester", &params).unwrap(); // X.1A
        queue
            .store()
            .write_token(SequenceToken {
                number: 1,
                letter: 'C',
            })
            .unwrap();
        queue.add("tester", &params).unwrap(); // X.1C
        queue
            .store()
            .write_token(SequenceToken {
                number: 1,
                letter: 'B',
            })
            .unwrap();
        queue.add("tester", &params).unwrap(); // X.1B
        (dir, queue)
    }

    #[test]
    fn test_pick_next_takes_smallest_suffix() {
        let (_dir, queue) = seeded_queue();
        let store = queue.store();

        assert_eq!(pick_next(store).unwrap(), Some("X.1A".to_string()));
        assert_eq!(pick_next(store).unwrap(), Some("X.1B".to_string()));
        // Picked runs have left the queue for the active slot.
        assert!(store.active_dir().join("X.1A").is_dir());
        assert_eq!(queue.list().unwrap().len(), 1);

        assert_eq!(pick_next(store).unwrap(), Some("X.1C".to_string()));
        assert_eq!(pick_next(store).unwrap(), None);
    }

    #[test]
    fn test_daemon_archives_unknown_driver_as_failed() {
        let (_dir, queue) = seeded_queue();
        let store = queue.store().clone();
        // Empty registry: every run fails fast but must still be archived.
        let handle = RunDaemon::start(
            store.clone(),
            Arc::new(DriverRegistry::new()),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(50),
        )
        .unwrap();

        // Wait for the queue to drain.
        for _ in 0..100 {
            if RunQueue::new(store.clone()).list().unwrap().is_empty()
                && handle.current_run_id().is_none()
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        handle.exit();

        for run_id in ["X.1A", "X.1B", "X.1C"] {
            let dir = store.output_dir().join(run_id);
            assert!(dir.is_dir(), "{} not archived", run_id);
            assert!(dir.join("FAILED").is_file(), "{} missing FAILED note", run_id);
        }
    }
}
