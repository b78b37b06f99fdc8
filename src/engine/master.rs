//! The run controller
//!
//! The master owns the run clock, starts agents through an
//! [`AgentFactory`], broadcasts the frozen [`RunInfo`] (with the computed
//! bench start time) to every agent, releases the start barrier, and
//! finally collects and aggregates per-thread metrics. Agents call back
//! through [`MasterServices`] for time synchronization and abort requests.
//!
//! Every master→agent call is made through a transport-shaped interface:
//! a failed call is retried once, a second failure aborts the run. Abort is
//! idempotent: the first call fans `stop_all` out to every agent, later
//! calls return immediately.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::config::{RunConfig, RunInfo};
use crate::engine::metrics::{Metrics, RunSummary};
use crate::error::{RunError, TransportError};
use crate::util::Timer;

/// Callbacks agents make on the master
#[cfg_attr(test, mockall::automock)]
pub trait MasterServices: Send + Sync {
    /// Master clock reading, ms
    fn current_time_millis(&self) -> Result<i64, TransportError>;

    /// Abort the whole run. Idempotent.
    fn abort_run(&self) -> Result<(), TransportError>;
}

/// What one agent hands back after all of its threads have ended
#[derive(Debug)]
pub struct AgentReport {
    pub metrics: Vec<Metrics>,
    /// Human-readable reasons for threads that exited with an error
    pub failures: Vec<String>,
}

/// Master-to-agent method surface
pub trait AgentService: Send + Sync {
    fn agent_id(&self) -> usize;

    /// Master-adjusted ms at which the agent finished construction and
    /// clock sync
    fn ready_time(&self) -> Result<i64, TransportError>;

    /// Store the run snapshot and instantiate driver threads
    fn configure(&self, run: Arc<RunInfo>) -> Result<(), TransportError>;

    /// Start the OS threads; they block on the time-set latch
    fn start_threads(&self) -> Result<(), TransportError>;

    /// Open the time-set latch
    fn release_start(&self) -> Result<(), TransportError>;

    /// Stop every driver thread and wake all of its waits
    fn stop_all(&self) -> Result<(), TransportError>;

    /// Block until all threads have ended, then return their metrics
    fn collect(&self) -> Result<AgentReport, TransportError>;
}

/// Creates agents on whatever hosts the deployment provides.
///
/// The in-process implementation lives in
/// [`engine::agent`](crate::engine::agent); remote transports implement the
/// same pair of traits.
pub trait AgentFactory: Send + Sync {
    fn start_agent(
        &self,
        agent_id: usize,
        master: Arc<dyn MasterServices>,
    ) -> Result<Arc<dyn AgentService>, TransportError>;
}

struct MasterCore {
    timer: Timer,
    running: AtomicBool,
    aborting: AtomicBool,
    agents: Mutex<Vec<Arc<dyn AgentService>>>,
    run_info: Mutex<Option<Arc<RunInfo>>>,
}

impl MasterServices for MasterCore {
    fn current_time_millis(&self) -> Result<i64, TransportError> {
        Ok(self.timer.now())
    }

    fn abort_run(&self) -> Result<(), TransportError> {
        if self.aborting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        warn!("aborting run: stopping all agents");
        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        for agent in agents.iter() {
            if let Err(e) = agent.stop_all() {
                error!(agent = agent.agent_id(), "stop_all failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Run controller: one per harness, one run at a time
#[derive(Clone)]
pub struct Master {
    core: Arc<MasterCore>,
}

impl Master {
    pub fn new() -> Self {
        Self {
            core: Arc::new(MasterCore {
                timer: Timer::new(),
                running: AtomicBool::new(false),
                aborting: AtomicBool::new(false),
                agents: Mutex::new(Vec::new()),
                run_info: Mutex::new(None),
            }),
        }
    }

    /// The callback surface to hand to agents
    pub fn services(&self) -> Arc<dyn MasterServices> {
        Arc::clone(&self.core) as Arc<dyn MasterServices>
    }

    /// Execute the start protocol: create agents, compute the bench start
    /// time from the slowest agent's readiness, broadcast the run snapshot,
    /// release the start barrier.
    pub fn start_run(
        &self,
        run_id: &str,
        config: RunConfig,
        factory: &dyn AgentFactory,
    ) -> Result<(), RunError> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Err(RunError::Config(
                "a run is already in progress on this master".to_string(),
            ));
        }
        self.core.aborting.store(false, Ordering::SeqCst);
        let started = self.start_run_inner(run_id, config, factory);
        if started.is_err() {
            self.core.running.store(false, Ordering::SeqCst);
        }
        started
    }

    fn start_run_inner(
        &self,
        run_id: &str,
        config: RunConfig,
        factory: &dyn AgentFactory,
    ) -> Result<(), RunError> {
        let agent_count = config.run.agents.max(1);
        let mut agents: Vec<Arc<dyn AgentService>> = Vec::with_capacity(agent_count);
        for agent_id in 0..agent_count {
            let agent = self.retry("start_agent", || {
                factory.start_agent(agent_id, self.services())
            })?;
            agents.push(agent);
        }
        *self.core.agents.lock().unwrap_or_else(|e| e.into_inner()) = agents.clone();

        // Trigger time: the slowest agent plus the configured slack.
        let mut latest_ready = self.core.timer.now();
        for agent in &agents {
            let ready = self.retry("ready_time", || agent.ready_time())?;
            latest_ready = latest_ready.max(ready);
        }
        let bench_start_time = latest_ready + config.run.start_slack_ms;

        let info = Arc::new(RunInfo {
            run_id: run_id.to_string(),
            bench_start_time,
            config,
        });
        for agent in &agents {
            self.retry("configure", || agent.configure(Arc::clone(&info)))?;
        }
        for agent in &agents {
            self.retry("start_threads", || agent.start_threads())?;
        }
        for agent in &agents {
            self.retry("release_start", || agent.release_start())?;
        }
        // An abort can land while the protocol is still under way, before
        // the threads it should stop exist. Re-fan the stop out once
        // everything is wired so no thread survives an early abort.
        if self.core.aborting.load(Ordering::SeqCst) {
            for agent in &agents {
                let _ = agent.stop_all();
            }
        }
        info!(
            run_id,
            bench_start_time,
            agents = agent_count,
            "run started"
        );
        *self.core.run_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info);
        Ok(())
    }

    /// Wait for every agent to finish and aggregate the result. Partial
    /// metrics come back marked aborted when anything went wrong.
    pub fn join_run(&self) -> Result<RunResult, RunError> {
        let info = self
            .core
            .run_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RunError::Config("no run in progress".to_string()))?;
        let agents = self
            .core
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut metrics = Vec::new();
        let mut failures = Vec::new();
        for agent in &agents {
            match self.retry("collect", || agent.collect()) {
                Ok(report) => {
                    metrics.extend(report.metrics);
                    failures.extend(report.failures);
                }
                Err(e) => failures.push(format!("agent {} lost: {}", agent.agent_id(), e)),
            }
        }

        let aborted = self.core.aborting.load(Ordering::SeqCst) || !failures.is_empty();
        let summary = RunSummary::aggregate(
            &info.run_id,
            &info.config.benchmark.short_name,
            aborted,
            info.config.run.steady_state,
            &metrics,
        );
        self.core
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.core.running.store(false, Ordering::SeqCst);
        info!(run_id = %info.run_id, aborted, "run complete");
        Ok(RunResult {
            run_id: info.run_id.clone(),
            aborted,
            failures,
            summary,
            metrics,
        })
    }

    /// Abort the current run, if any
    pub fn kill(&self) {
        let _ = self.core.abort_run();
    }

    /// One retry, then abort: the policy for every master→agent call
    fn retry<T>(
        &self,
        what: &str,
        call: impl Fn() -> Result<T, TransportError>,
    ) -> Result<T, RunError> {
        match call() {
            Ok(v) => Ok(v),
            Err(first) => {
                warn!("{} failed ({}); retrying once", what, first);
                match call() {
                    Ok(v) => Ok(v),
                    Err(second) => {
                        error!("{} failed after retry: {}", what, second);
                        let _ = self.core.abort_run();
                        Err(RunError::Transport(second))
                    }
                }
            }
        }
    }
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

/// Final state of one run
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub aborted: bool,
    /// Reasons for any fatal thread or agent failures
    pub failures: Vec<String>,
    pub summary: RunSummary,
    pub metrics: Vec<Metrics>,
}

impl RunResult {
    /// Write `summary.json` and `summary.txt` into the run directory
    pub fn write_report(&self, dir: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.summary)
            .context("Failed to serialize run summary")?;
        std::fs::write(dir.join("summary.json"), json)
            .with_context(|| format!("Failed to write summary.json in {}", dir.display()))?;
        std::fs::write(dir.join("summary.txt"), self.summary.render_text())
            .with_context(|| format!("Failed to write summary.txt in {}", dir.display()))?;
        Ok(())
    }
}
