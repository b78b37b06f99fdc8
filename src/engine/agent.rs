//! The in-process agent: N driver threads behind the agent RPC surface
//!
//! One agent hosts the driver threads of one driver type on one host. This
//! implementation runs in the master's process; a remote deployment would
//! put the same [`AgentService`] surface behind a wire transport without
//! touching the engine. Clock synchronization happens once, at agent
//! construction: the agent samples the master clock, brackets the sample
//! with local readings, and folds the midpoint offset into its own timer.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::RunInfo;
use crate::engine::driver::DriverFactory;
use crate::engine::master::{AgentFactory, AgentReport, AgentService, MasterServices};
use crate::engine::metrics::Metrics;
use crate::engine::thread::{DriverThread, RunLatches, ThreadShared, ThreadState};
use crate::error::{RunError, TransportError};
use crate::util::Timer;

struct ThreadSlot {
    shared: Arc<ThreadShared>,
    /// Present between `configure` and `start_threads`
    worker: Option<DriverThread>,
    /// Present once the OS thread is running
    handle: Option<JoinHandle<(Metrics, Result<(), RunError>)>>,
}

struct AgentInner {
    latches: Option<Arc<RunLatches>>,
    threads: Vec<ThreadSlot>,
}

/// Agent implementation living in the master's process
pub struct LocalAgent {
    id: usize,
    master: Arc<dyn MasterServices>,
    driver_factory: Arc<dyn DriverFactory>,
    timer: Timer,
    ready_at: i64,
    shutting_down: Arc<AtomicBool>,
    inner: Mutex<AgentInner>,
}

impl LocalAgent {
    /// Construct the agent and synchronize its clock against the master
    pub fn start(
        id: usize,
        master: Arc<dyn MasterServices>,
        driver_factory: Arc<dyn DriverFactory>,
        shutting_down: Arc<AtomicBool>,
    ) -> Result<Self, TransportError> {
        let mut timer = Timer::new();
        let before = timer.now();
        let master_now = master.current_time_millis()?;
        let after = timer.now();
        let offset = Timer::offset_against(before, master_now, after);
        timer.adjust(offset);
        let ready_at = timer.now();
        info!(agent = id, offset_ms = offset, "agent ready");
        Ok(Self {
            id,
            master,
            driver_factory,
            timer,
            ready_at,
            shutting_down,
            inner: Mutex::new(AgentInner {
                latches: None,
                threads: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AgentInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AgentService for LocalAgent {
    fn agent_id(&self) -> usize {
        self.id
    }

    fn ready_time(&self) -> Result<i64, TransportError> {
        Ok(self.ready_at)
    }

    fn configure(&self, run: Arc<RunInfo>) -> Result<(), TransportError> {
        let thread_count = run.config.driver.threads;
        let latches = Arc::new(RunLatches::new(thread_count));
        let mut threads = Vec::with_capacity(thread_count);
        for thread_id in 0..thread_count {
            let driver = self.driver_factory.create(thread_id).map_err(|e| {
                TransportError::AgentFailed(self.id, format!("driver creation failed: {}", e))
            })?;
            let shared = Arc::new(ThreadShared::new());
            let worker = DriverThread::new(
                self.id,
                thread_id,
                Arc::clone(&run),
                self.timer.clone(),
                Arc::clone(&self.master),
                driver,
                Arc::clone(&shared),
                Arc::clone(&latches),
                Arc::clone(&self.shutting_down),
            );
            threads.push(ThreadSlot {
                shared,
                worker: Some(worker),
                handle: None,
            });
        }
        let mut inner = self.lock();
        inner.latches = Some(latches);
        inner.threads = threads;
        debug!(agent = self.id, threads = thread_count, "agent configured");
        Ok(())
    }

    fn start_threads(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        for (thread_id, slot) in inner.threads.iter_mut().enumerate() {
            if let Some(worker) = slot.worker.take() {
                let name = format!("driver-{}-{}", self.id, thread_id);
                let handle = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || worker.run())
                    .map_err(|e| {
                        TransportError::AgentFailed(self.id, format!("thread spawn failed: {}", e))
                    })?;
                slot.handle = Some(handle);
            }
        }
        Ok(())
    }

    fn release_start(&self) -> Result<(), TransportError> {
        let inner = self.lock();
        match &inner.latches {
            Some(latches) => {
                latches.time_set.count_down();
                Ok(())
            }
            None => Err(TransportError::AgentFailed(
                self.id,
                "release_start before configure".to_string(),
            )),
        }
    }

    fn stop_all(&self) -> Result<(), TransportError> {
        let inner = self.lock();
        info!(agent = self.id, "stopping all driver threads");
        for slot in &inner.threads {
            slot.shared.stop.stop();
        }
        // Threads blocked on a start barrier wake here and observe the flag.
        if let Some(latches) = &inner.latches {
            latches.time_set.open();
            latches.pre_run.open();
        }
        Ok(())
    }

    fn collect(&self) -> Result<AgentReport, TransportError> {
        // Take the handles out and release the agent lock before blocking:
        // an abort arriving mid-collect must still be able to stop_all.
        let taken: Vec<(Arc<ThreadShared>, Option<JoinHandle<_>>)> = {
            let mut inner = self.lock();
            inner
                .threads
                .iter_mut()
                .map(|slot| (Arc::clone(&slot.shared), slot.handle.take()))
                .collect()
        };

        let mut metrics = Vec::new();
        let mut failures = Vec::new();
        for (thread_id, (shared, handle)) in taken.into_iter().enumerate() {
            // A live run blocks here for its whole duration. Once a thread
            // has been told to stop it gets one 10-second cycle to reach
            // Ended before it is abandoned.
            loop {
                if shared
                    .state
                    .wait_for_timeout(ThreadState::Ended, Duration::from_secs(10))
                {
                    break;
                }
                if shared.stop.is_stopped() {
                    warn!(
                        agent = self.id,
                        thread = thread_id,
                        "thread did not end within 10s of stop; abandoning it"
                    );
                    failures.push(format!(
                        "agent {} thread {} did not end after stop",
                        self.id, thread_id
                    ));
                    break;
                }
            }
            if shared.state.get() != ThreadState::Ended {
                continue;
            }
            match handle.map(|h| h.join()) {
                Some(Ok((thread_metrics, outcome))) => {
                    metrics.push(thread_metrics);
                    if let Err(e) = outcome {
                        failures.push(format!(
                            "agent {} thread {}: {}",
                            self.id, thread_id, e
                        ));
                    }
                }
                Some(Err(_)) => {
                    failures.push(format!("agent {} thread {} panicked", self.id, thread_id))
                }
                None => {}
            }
        }
        Ok(AgentReport { metrics, failures })
    }
}

/// Starts [`LocalAgent`]s in the current process
pub struct LocalAgentFactory {
    driver_factory: Arc<dyn DriverFactory>,
    shutting_down: Arc<AtomicBool>,
}

impl LocalAgentFactory {
    pub fn new(driver_factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            driver_factory,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a process-wide shutdown flag; the once-after retry loop stops
    /// retrying once it is set
    pub fn with_shutdown_flag(
        driver_factory: Arc<dyn DriverFactory>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            driver_factory,
            shutting_down,
        }
    }
}

impl AgentFactory for LocalAgentFactory {
    fn start_agent(
        &self,
        agent_id: usize,
        master: Arc<dyn MasterServices>,
    ) -> Result<Arc<dyn AgentService>, TransportError> {
        let agent = LocalAgent::start(
            agent_id,
            master,
            Arc::clone(&self.driver_factory),
            Arc::clone(&self.shutting_down),
        )?;
        Ok(Arc::new(agent))
    }
}
