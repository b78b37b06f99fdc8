//! Drover - distributed load-generation harness
//!
//! Queue-manager entry point: submit runs, inspect and prune the queue,
//! run the daemon that executes them one at a time.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drover::config::{default_data_dir, OperationDef};
use drover::engine::context::DriverContext;
use drover::engine::driver::{Driver, DriverFactory, DriverRegistry};
use drover::error::DriverError;
use drover::runq::daemon::{RunDaemon, KILL_MARKER, STOP_MARKER};
use drover::{QueueStore, RunQueue};

#[derive(Parser)]
#[command(name = "drover", version, about = "Distributed load-generation harness")]
struct Cli {
    /// Harness data directory (queue, active run, archived output)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a benchmark run from a parameter file
    Submit {
        /// Parameter repository (TOML)
        config: PathBuf,
        /// Submitter recorded with the run
        #[arg(long)]
        submitter: Option<String>,
    },
    /// List pending runs in pick order
    List,
    /// Show the active run and queue depth
    Status,
    /// Remove a not-yet-started run from the queue
    Delete { run_id: String },
    /// Abort the currently executing run
    Kill { run_id: String },
    /// Show the most recent valid run id of a benchmark
    Prev { bench: String },
    /// Execute queued runs until told to stop
    Daemon {
        /// Queue poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },
    /// Ask a running daemon to stop after its current run
    StopDaemon,
    /// Print a sample parameter file for the built-in sleeper driver
    Sample,
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let store = QueueStore::open(&data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let queue = RunQueue::new(store.clone());

    match cli.command {
        Command::Submit { config, submitter } => {
            let submitter = submitter
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "unknown".to_string());
            let run_id = queue.add(&submitter, &config)?;
            println!("{}", run_id);
        }
        Command::List => {
            for entry in queue.list()? {
                println!(
                    "{:<20} {:<12} {:<24} {}",
                    entry.run_id,
                    entry.submitter,
                    entry.submit_time.format("%Y-%m-%d %H:%M:%S"),
                    entry.description,
                );
            }
        }
        Command::Status => {
            let active: Vec<String> = std::fs::read_dir(store.active_dir())?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect();
            match active.as_slice() {
                [] => println!("idle"),
                runs => println!("running: {}", runs.join(", ")),
            }
            println!("queued: {}", queue.list()?.len());
        }
        Command::Delete { run_id } => {
            if queue.delete(&run_id)? {
                println!("deleted {}", run_id);
            } else {
                anyhow::bail!("run '{}' is not in the queue", run_id);
            }
        }
        Command::Kill { run_id } => {
            let dir = store.active_dir().join(&run_id);
            if !dir.is_dir() {
                anyhow::bail!("run '{}' is not executing", run_id);
            }
            std::fs::write(dir.join(KILL_MARKER), "")
                .with_context(|| format!("Failed to write kill marker for {}", run_id))?;
            println!("kill requested for {}", run_id);
        }
        Command::Prev { bench } => match queue.get_valid_prev_run(&bench)? {
            Some(run_id) => println!("{}", run_id),
            None => println!("no previous run for {}", bench),
        },
        Command::Daemon { poll_ms } => {
            let _ = std::fs::remove_file(store.base().join(STOP_MARKER));
            let mut registry = DriverRegistry::new();
            registry.register(Arc::new(SleeperFactory));
            let handle = RunDaemon::start(
                store,
                Arc::new(registry),
                Arc::new(AtomicBool::new(false)),
                Duration::from_millis(poll_ms),
            )?;
            handle.join();
        }
        Command::StopDaemon => {
            std::fs::write(store.base().join(STOP_MARKER), "")
                .context("Failed to write stop marker")?;
            println!("stop requested");
        }
        Command::Sample => print!("{}", SAMPLE_PARAMS),
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Built-in sleeper driver
// ---------------------------------------------------------------------------

/// Driver that sleeps for `params.sleep_ms` per operation. Exists so the
/// harness can be exercised end to end without a system under test.
struct SleeperDriver;

impl Driver for SleeperDriver {
    fn operate(&mut self, op: &OperationDef, ctx: &mut DriverContext) -> Result<(), DriverError> {
        let sleep_ms = op
            .params
            .get("sleep_ms")
            .and_then(|v| v.as_integer())
            .unwrap_or(10) as u64;
        ctx.record_time();
        std::thread::sleep(Duration::from_millis(sleep_ms));
        ctx.record_time();
        Ok(())
    }
}

struct SleeperFactory;

impl DriverFactory for SleeperFactory {
    fn driver_name(&self) -> &str {
        "sleeper"
    }

    fn create(&self, _thread_id: usize) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(SleeperDriver))
    }
}

const SAMPLE_PARAMS: &str = r#"[benchmark]
short_name = "sleep"
description = "harness self-test against the built-in sleeper driver"

[run]
ramp_up = 2
steady_state = 10
ramp_down = 2

[driver]
name = "sleeper"
threads = 4

[[driver.operations]]
name = "nap"
timing = "manual"
cycle = { type = "thinktime", dist = "negexp", mean = 200, max = 1000 }
params = { sleep_ms = 20 }

[[driver.operations]]
name = "doze"
timing = "manual"
cycle = { type = "cycletime", dist = "fixed", ms = 500 }
params = { sleep_ms = 50 }

[driver.foreground]
mix = { type = "flat", weights = [70.0, 30.0] }
initial_delay = { dist = "uniform", min = 0, max = 250 }
"#;
