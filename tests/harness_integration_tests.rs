//! End-to-end runs through the master/agent coordination plane
//!
//! These tests drive real OS driver threads against an in-process test
//! driver: a full start protocol, steady-state-only measurement, abort
//! fan-out, and trigger expiry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drover::config::{OperationDef, RunConfig};
use drover::engine::agent::LocalAgentFactory;
use drover::engine::context::DriverContext;
use drover::engine::driver::{Driver, DriverFactory};
use drover::engine::master::Master;
use drover::error::DriverError;

/// Test driver: stamps timing, counts every invocation, optionally fails
/// fatally after a threshold on the first driver instance created
struct TestDriver {
    invocations: Arc<AtomicUsize>,
    fatal_after: Option<usize>,
    my_invocations: usize,
}

impl Driver for TestDriver {
    fn operate(&mut self, _op: &OperationDef, ctx: &mut DriverContext) -> Result<(), DriverError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.my_invocations += 1;
        if let Some(n) = self.fatal_after {
            if self.my_invocations > n {
                return Err(DriverError::fatal(anyhow::anyhow!(
                    "injected fatal after {} operations",
                    n
                )));
            }
        }
        ctx.record_time();
        std::thread::sleep(Duration::from_millis(2));
        ctx.record_time();
        Ok(())
    }
}

struct TestFactory {
    invocations: Arc<AtomicUsize>,
    instances: AtomicUsize,
    /// When set, the first driver instance goes fatal after N operations
    first_instance_fatal_after: Option<usize>,
}

impl TestFactory {
    fn new(first_instance_fatal_after: Option<usize>) -> Self {
        Self {
            invocations: Arc::new(AtomicUsize::new(0)),
            instances: AtomicUsize::new(0),
            first_instance_fatal_after,
        }
    }
}

impl DriverFactory for TestFactory {
    fn driver_name(&self) -> &str {
        "test"
    }

    fn create(&self, _thread_id: usize) -> Result<Box<dyn Driver>, DriverError> {
        let instance = self.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestDriver {
            invocations: Arc::clone(&self.invocations),
            fatal_after: self.first_instance_fatal_after.filter(|_| instance == 0),
            my_invocations: 0,
        }))
    }
}

fn config(toml_src: &str) -> RunConfig {
    let config: RunConfig = toml::from_str(toml_src).unwrap();
    config.validate().unwrap();
    config
}

#[test]
fn test_time_run_counts_only_steady_state() {
    let config = config(
        r#"
        [benchmark]
        short_name = "e2e"

        [run]
        ramp_up = 1
        steady_state = 2
        ramp_down = 1
        start_slack_ms = 150

        [driver]
        name = "test"
        threads = 2

        [[driver.operations]]
        name = "poke"
        timing = "manual"
        cycle = { type = "cycletime", dist = "fixed", ms = 50 }

        [driver.foreground]
        mix = { type = "flat", weights = [1.0] }
        "#,
    );

    let factory = Arc::new(TestFactory::new(None));
    let invocations = Arc::clone(&factory.invocations);
    let agent_factory = LocalAgentFactory::new(factory);
    let master = Master::new();
    master.start_run("e2e.1A", config, &agent_factory).unwrap();
    let result = master.join_run().unwrap();

    assert!(!result.aborted, "failures: {:?}", result.failures);
    let row = &result.summary.operations[0];
    // 2 threads at a 50ms cycle over a 2s steady window: ~80 measured
    // operations. Ramp operations ran but were not counted.
    assert!(row.count >= 20, "implausibly few measured ops: {}", row.count);
    assert!(row.count <= 120, "more ops than the window allows: {}", row.count);
    let invoked = invocations.load(Ordering::Relaxed) as u64;
    assert!(
        invoked > row.count,
        "ramp operations ({} invoked, {} counted) must be excluded",
        invoked,
        row.count
    );
    assert_eq!(row.errors, 0);
    assert!(row.mean_ms < 50.0, "sleep(2ms) measured as {}ms", row.mean_ms);
}

#[test]
fn test_fatal_error_aborts_all_agents() {
    let config = config(
        r#"
        [benchmark]
        short_name = "e2e"

        [run]
        ramp_up = 0
        steady_state = 30
        ramp_down = 0
        agents = 2
        start_slack_ms = 150

        [driver]
        name = "test"
        threads = 3

        [[driver.operations]]
        name = "poke"
        timing = "manual"
        cycle = { type = "cycletime", dist = "fixed", ms = 20 }

        [driver.foreground]
        mix = { type = "flat", weights = [1.0] }
        "#,
    );

    let began = Instant::now();
    let factory = Arc::new(TestFactory::new(Some(5)));
    let agent_factory = LocalAgentFactory::new(factory);
    let master = Master::new();
    master.start_run("e2e.1B", config, &agent_factory).unwrap();
    let result = master.join_run().unwrap();

    // The run was configured for 30s of steady state but one thread went
    // fatal a fraction of a second in; every thread on both agents must
    // have ended well before the nominal end.
    assert!(result.aborted);
    assert!(
        result.failures.iter().any(|f| f.contains("injected fatal")),
        "failures: {:?}",
        result.failures
    );
    assert!(
        began.elapsed() < Duration::from_secs(15),
        "abort did not propagate promptly ({:?})",
        began.elapsed()
    );
    // Partial metrics still come back: 6 threads were configured.
    assert_eq!(result.metrics.len(), 6);
}

#[test]
fn test_expired_trigger_aborts_run() {
    let config = config(
        r#"
        [benchmark]
        short_name = "e2e"

        [run]
        steady_state = 5
        start_slack_ms = -1000

        [driver]
        name = "test"
        threads = 2

        [[driver.operations]]
        name = "poke"
        timing = "manual"
        cycle = { type = "cycletime", dist = "fixed", ms = 20 }

        [driver.foreground]
        mix = { type = "flat", weights = [1.0] }
        "#,
    );

    let factory = Arc::new(TestFactory::new(None));
    let invocations = Arc::clone(&factory.invocations);
    let agent_factory = LocalAgentFactory::new(factory);
    let master = Master::new();
    master.start_run("e2e.1C", config, &agent_factory).unwrap();
    let result = master.join_run().unwrap();

    assert!(result.aborted);
    assert!(
        result
            .failures
            .iter()
            .any(|f| f.contains("TriggerTime has expired")),
        "failures: {:?}",
        result.failures
    );
    assert_eq!(
        invocations.load(Ordering::Relaxed),
        0,
        "no workload may run after an expired trigger"
    );
}

#[test]
fn test_cycle_run_executes_exact_count() {
    let config = config(
        r#"
        [benchmark]
        short_name = "e2e"

        [run]
        start_slack_ms = 100

        [driver]
        name = "test"
        threads = 2
        run_control = "cycles"
        cycles = 4

        [[driver.operations]]
        name = "poke"
        timing = "manual"
        cycle = { type = "thinktime", dist = "fixed", ms = 5 }

        [driver.foreground]
        mix = { type = "flat", weights = [1.0] }
        "#,
    );

    let factory = Arc::new(TestFactory::new(None));
    let agent_factory = LocalAgentFactory::new(factory);
    let master = Master::new();
    master.start_run("e2e.1D", config, &agent_factory).unwrap();
    let result = master.join_run().unwrap();

    assert!(!result.aborted, "failures: {:?}", result.failures);
    // Cycle-controlled with no phase schedule: every cycle is measured.
    assert_eq!(result.summary.operations[0].count, 8);
}
