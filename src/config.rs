//! Run configuration: the benchmark parameter repository
//!
//! Handles loading, validating and snapshotting the TOML parameter
//! repository that travels with every run. The file is copied verbatim into
//! the run directory at submission; the daemon re-reads it when the run is
//! picked, and the resulting [`RunConfig`], frozen into a [`RunInfo`]
//! together with the bench start time, is what the master broadcasts to
//! every agent.
//!
//! # Configuration File Format
//!
//! ```toml
//! [benchmark]
//! short_name = "web"
//! description = "storefront load"
//!
//! [run]
//! ramp_up = 30
//! steady_state = 300
//! ramp_down = 30
//!
//! [driver]
//! name = "storefront"
//! threads = 20
//!
//! [[driver.operations]]
//! name = "browse"
//! cycle = { type = "thinktime", dist = "negexp", mean = 5000, max = 25000 }
//!
//! [[driver.operations]]
//! name = "checkout"
//! cycle = { type = "thinktime", dist = "fixed", ms = 10000 }
//!
//! [driver.foreground]
//! mix = { type = "flat", weights = [80.0, 20.0] }
//! initial_delay = { dist = "uniform", min = 0, max = 1000 }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::cycle::{Cycle, CycleType, Delay};
use crate::engine::mix::MixSpec;

/// Characters allowed in a benchmark short name (it becomes the run-id
/// prefix, `<shortName>.<seqInt><seqChar>`)
pub fn valid_short_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Root of the parameter repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub benchmark: BenchmarkInfo,
    #[serde(default)]
    pub run: RunSettings,
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkInfo {
    /// Short name, used as the run-id prefix
    pub short_name: String,
    #[serde(default)]
    pub description: String,
}

/// Phase schedule and harness knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Ramp-up seconds (operations not counted)
    #[serde(default)]
    pub ramp_up: u32,
    /// Steady-state seconds (the measured window)
    #[serde(default)]
    pub steady_state: u32,
    /// Ramp-down seconds (operations not counted)
    #[serde(default)]
    pub ramp_down: u32,
    /// Number of agents to start
    #[serde(default = "default_agents")]
    pub agents: usize,
    /// Slack between agent readiness and the bench start trigger, ms
    #[serde(default = "default_start_slack")]
    pub start_slack_ms: i64,
    /// Optional base seed for reproducible schedules
    #[serde(default)]
    pub seed: Option<u64>,
    /// Latency histogram bucket width, ms
    #[serde(default = "default_bucket_ms")]
    pub histogram_bucket_ms: i64,
}

fn default_agents() -> usize {
    1
}

fn default_start_slack() -> i64 {
    2000
}

fn default_bucket_ms() -> i64 {
    10
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            ramp_up: 0,
            steady_state: 0,
            ramp_down: 0,
            agents: default_agents(),
            start_slack_ms: default_start_slack(),
            seed: None,
            histogram_bucket_ms: default_bucket_ms(),
        }
    }
}

/// Whether a run ends on the wall clock or on a cycle count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunControl {
    Time,
    Cycles,
}

impl Default for RunControl {
    fn default() -> Self {
        RunControl::Time
    }
}

/// How an operation's latency window gets stamped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingMode {
    /// An instrumented transport stamps invoke/respond around the request
    Auto,
    /// Driver code brackets its own critical section with `record_time`
    Manual,
}

impl Default for TimingMode {
    fn default() -> Self {
        TimingMode::Auto
    }
}

/// Per-driver-type configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver type name; must match a registered driver factory
    pub name: String,
    /// Virtual users per agent
    pub threads: usize,
    #[serde(default)]
    pub run_control: RunControl,
    /// Foreground cycles per thread; required when `run_control = "cycles"`
    #[serde(default)]
    pub cycles: Option<u64>,
    /// Ordered operation table
    pub operations: Vec<OperationDef>,
    /// Foreground mix (mix id 0)
    pub foreground: MixEntry,
    /// Optional background mix (mix id 1); enables the second virtual clock
    #[serde(default)]
    pub background: Option<MixEntry>,
}

/// One mix slot: the operation chooser plus the first-invocation delay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixEntry {
    pub mix: MixSpec,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: Cycle,
}

fn default_initial_delay() -> Cycle {
    Cycle {
        kind: CycleType::CycleTime,
        delay: Delay::Fixed { ms: 0 },
    }
}

/// One entry of the operation table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDef {
    pub name: String,
    #[serde(default)]
    pub timing: TimingMode,
    pub cycle: Cycle,
    /// Background operations belong to mix id 1
    #[serde(default)]
    pub background: bool,
    /// Free-form parameters passed through to driver code
    #[serde(default)]
    pub params: toml::Table,
}

impl RunConfig {
    /// Load and validate a parameter repository
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameter file: {}", path.display()))?;
        let config: RunConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse parameter file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).context("Failed to serialize run configuration")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write parameter file: {}", path.display()))?;
        Ok(())
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> Result<()> {
        if !valid_short_name(&self.benchmark.short_name) {
            anyhow::bail!(
                "benchmark short name '{}' must match [A-Za-z0-9_-]+",
                self.benchmark.short_name
            );
        }
        let d = &self.driver;
        if d.threads == 0 {
            anyhow::bail!("driver.threads must be at least 1");
        }
        if d.operations.is_empty() {
            anyhow::bail!("driver.operations must not be empty");
        }
        match d.run_control {
            RunControl::Cycles => {
                if d.cycles.unwrap_or(0) == 0 {
                    anyhow::bail!("run_control = \"cycles\" requires a positive driver.cycles");
                }
                if d.background.is_some() {
                    anyhow::bail!("background mixes require run_control = \"time\"");
                }
            }
            RunControl::Time => {
                if self.run.steady_state == 0 {
                    anyhow::bail!("run_control = \"time\" requires a positive run.steady_state");
                }
            }
        }

        let fg = d.foreground_ops();
        if fg.is_empty() {
            anyhow::bail!("operation table has no foreground operations");
        }
        d.foreground
            .mix
            .validate(fg.len())
            .map_err(|e| anyhow::anyhow!("foreground {}", e))?;

        let bg = d.background_ops();
        match (&d.background, bg.is_empty()) {
            (Some(entry), false) => entry
                .mix
                .validate(bg.len())
                .map_err(|e| anyhow::anyhow!("background {}", e))?,
            (Some(_), true) => {
                anyhow::bail!("background mix configured but no operation is marked background")
            }
            (None, false) => {
                anyhow::bail!("background operations configured but driver.background is missing")
            }
            (None, true) => {}
        }
        Ok(())
    }
}

impl DriverConfig {
    /// Indices into the operation table belonging to the foreground mix
    pub fn foreground_ops(&self) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| !op.background)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices into the operation table belonging to the background mix
    pub fn background_ops(&self) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.background)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.name.clone()).collect()
    }
}

/// The frozen per-run snapshot broadcast to all agents
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    /// Absolute master-clock ms at which all threads begin their workload
    pub bench_start_time: i64,
    pub config: RunConfig,
}

impl RunInfo {
    /// Steady-state window start (inclusive), master ms
    pub fn steady_start(&self) -> i64 {
        self.bench_start_time + self.config.run.ramp_up as i64 * 1000
    }

    /// Steady-state window end (exclusive), master ms.
    ///
    /// A cycle-controlled run with no steady-state length measures every
    /// post-ramp cycle, so the window is unbounded on the right.
    pub fn steady_end(&self) -> i64 {
        if self.config.driver.run_control == RunControl::Cycles && self.config.run.steady_state == 0
        {
            i64::MAX
        } else {
            self.steady_start() + self.config.run.steady_state as i64 * 1000
        }
    }

    /// Wall-clock end of the whole run (time-controlled runs), master ms
    pub fn run_end(&self) -> i64 {
        let r = &self.config.run;
        self.bench_start_time + (r.ramp_up + r.steady_state + r.ramp_down) as i64 * 1000
    }

    /// `true` iff `[start, end]` lies entirely inside the steady-state
    /// window
    pub fn in_steady(&self, start: i64, end: i64) -> bool {
        start >= self.steady_start() && end < self.steady_end()
    }
}

/// Default harness data directory (`~/.local/share/drover` on Linux)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("drover"))
        .unwrap_or_else(|| PathBuf::from(".drover"))
}
