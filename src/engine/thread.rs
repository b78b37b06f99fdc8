//! The virtual-user state machine
//!
//! One `DriverThread` is one virtual user on one OS thread. Its life is a
//! fixed progression, `NotStarted → Initializing → PreRun → Running →
//! PostRun → Ended` (the pre/post states are thread 0 only), observable
//! through a condvar-backed state cell. The workload itself alternates
//! between sleeping to a computed invoke time and calling driver code, with
//! up to two mix slots (foreground and background) paced under separate
//! virtual clocks in the same thread.
//!
//! Failure policy, in one place: a fatal driver error, a timing-validation
//! miss, or an expired start trigger aborts the whole run; an ordinary
//! operation failure is counted against the operation when it lands in
//! steady state and the thread keeps going; a wait cut short by `stop` exits
//! the loop cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::{OperationDef, RunControl, RunInfo, TimingMode};
use crate::engine::context::DriverContext;
use crate::engine::cycle::Cycle;
use crate::engine::driver::Driver;
use crate::engine::master::MasterServices;
use crate::engine::metrics::Metrics;
use crate::engine::mix::Selector;
use crate::engine::pacer::{CyclePacer, Pacer, SlotClock, TimePacer, TimeWithBackgroundPacer};
use crate::engine::timing::UNSET;
use crate::error::{DriverError, FatalError, RunError};
use crate::sync::{CountDownLatch, StateCell, StopFlag};
use crate::util::{rng_for_thread, Timer};

/// Lifecycle states, strictly increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadState {
    NotStarted,
    Initializing,
    PreRun,
    Running,
    PostRun,
    Ended,
}

/// The three run barriers, shared by every thread of one agent
#[derive(Debug)]
pub struct RunLatches {
    /// Released by the master once the bench start time is broadcast
    pub time_set: CountDownLatch,
    /// Released by thread 0 after the once-before hook
    pub pre_run: CountDownLatch,
    /// Counted down by each thread when its workload ends
    pub post_run: CountDownLatch,
}

impl RunLatches {
    pub fn new(threads: usize) -> Self {
        Self {
            time_set: CountDownLatch::new(1),
            pre_run: CountDownLatch::new(1),
            post_run: CountDownLatch::new(threads),
        }
    }
}

/// Thread state visible to the agent and to terminators
#[derive(Debug)]
pub struct ThreadShared {
    pub state: StateCell<ThreadState>,
    pub stop: StopFlag,
}

impl ThreadShared {
    pub fn new() -> Self {
        Self {
            state: StateCell::new(ThreadState::NotStarted),
            stop: StopFlag::new(),
        }
    }
}

impl Default for ThreadShared {
    fn default() -> Self {
        Self::new()
    }
}

/// One mix slot: the chooser, its virtual clock, and its schedule
struct MixSlot {
    /// Global operation-table indices belonging to this mix
    ops: Vec<usize>,
    selector: Selector,
    initial_delay: Cycle,
    clock: SlotClock,
    /// Next scheduled invoke, master ms
    invoke_time: i64,
    /// Index (within `ops`) selected on the previous iteration
    prev_op: Option<usize>,
    cycle_count: u64,
}

enum OpOutcome {
    Continue,
    Stop,
}

/// One virtual user
pub struct DriverThread {
    agent_id: usize,
    thread_id: usize,
    info: Arc<RunInfo>,
    timer: Timer,
    master: Arc<dyn MasterServices>,
    driver: Box<dyn Driver>,
    shared: Arc<ThreadShared>,
    latches: Arc<RunLatches>,
    shutting_down: Arc<AtomicBool>,
    pacer: Box<dyn Pacer>,
    slots: Vec<MixSlot>,
    metrics: Metrics,
    ctx: DriverContext,
}

impl DriverThread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: usize,
        thread_id: usize,
        info: Arc<RunInfo>,
        timer: Timer,
        master: Arc<dyn MasterServices>,
        driver: Box<dyn Driver>,
        shared: Arc<ThreadShared>,
        latches: Arc<RunLatches>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let d = &info.config.driver;
        let mut rng = rng_for_thread(info.config.run.seed, agent_id, thread_id);

        // Construction policy: a background mix forces the time-bounded
        // two-clock shape; otherwise run control picks the pacer.
        let pacer: Box<dyn Pacer> = if d.background.is_some() {
            Box::new(TimeWithBackgroundPacer {
                run_end: info.run_end(),
            })
        } else if d.run_control == RunControl::Time {
            Box::new(TimePacer {
                run_end: info.run_end(),
            })
        } else {
            Box::new(CyclePacer {
                limit: d.cycles.unwrap_or(0),
            })
        };

        let mut slots = vec![MixSlot {
            ops: d.foreground_ops(),
            selector: d.foreground.mix.selector(&mut rng),
            initial_delay: d.foreground.initial_delay,
            clock: SlotClock::at(info.bench_start_time),
            invoke_time: info.bench_start_time,
            prev_op: None,
            cycle_count: 0,
        }];
        if pacer.has_background() {
            let entry = d.background.as_ref().expect("checked by construction");
            slots.push(MixSlot {
                ops: d.background_ops(),
                selector: entry.mix.selector(&mut rng),
                initial_delay: entry.initial_delay,
                clock: SlotClock::at(info.bench_start_time),
                invoke_time: info.bench_start_time,
                prev_op: None,
                cycle_count: 0,
            });
        }

        let metrics = Metrics::new(
            agent_id,
            thread_id,
            &d.operation_names(),
            info.config.run.histogram_bucket_ms,
        );
        let ctx = DriverContext::new(agent_id, thread_id, Arc::clone(&info), timer.clone(), rng);

        Self {
            agent_id,
            thread_id,
            info,
            timer,
            master,
            driver,
            shared,
            latches,
            shutting_down,
            pacer,
            slots,
            metrics,
            ctx,
        }
    }

    /// Run the virtual user to completion. Always leaves the thread in
    /// `Ended` with the post-run latch counted down, whatever the outcome.
    pub fn run(mut self) -> (Metrics, Result<(), RunError>) {
        self.shared.state.advance(ThreadState::Initializing);
        let result = self.execute();
        self.latches.post_run.count_down();
        if self.thread_id == 0 {
            self.run_post_hook();
        }
        self.shared.state.advance(ThreadState::Ended);
        (self.metrics, result)
    }

    fn execute(&mut self) -> Result<(), RunError> {
        // Block until the master broadcasts the bench start time.
        self.latches.time_set.wait();
        if self.shared.stop.is_stopped() {
            return Ok(());
        }

        let bench_start = self.info.bench_start_time;
        let head_start = bench_start - self.timer.now();
        if head_start <= 0 {
            let msg = format!(
                "TriggerTime has expired by {} ms; increase run.start_slack_ms",
                -head_start
            );
            error!(agent = self.agent_id, thread = self.thread_id, "{}", msg);
            self.request_abort();
            return Err(RunError::TriggerExpired(msg));
        }
        if !self.shared.stop.sleep_until(&self.timer, bench_start) {
            return Ok(());
        }

        if self.thread_id == 0 {
            self.shared.state.advance(ThreadState::PreRun);
            match self.driver.pre_run(&mut self.ctx) {
                Ok(()) => {}
                Err(DriverError::Interrupted) => {
                    // The run is being killed; redoing the hook is pointless.
                    debug!("once-before hook interrupted during termination");
                }
                Err(DriverError::Fatal(f)) => {
                    self.latches.pre_run.count_down();
                    return Err(self.raise_fatal(f));
                }
                Err(DriverError::Failed(e)) => {
                    self.latches.pre_run.count_down();
                    return Err(self.raise_fatal(FatalError::new(
                        e.context("once-before hook failed; run cannot start"),
                    )));
                }
            }
            self.latches.pre_run.count_down();
        } else {
            self.latches.pre_run.wait();
            if self.shared.stop.is_stopped() {
                return Ok(());
            }
        }

        self.shared.state.advance(ThreadState::Running);
        self.workload()
    }

    /// The main loop: pick the slot that is due next, sleep to its invoke
    /// time, run the chosen operation, reschedule the slot.
    fn workload(&mut self) -> Result<(), RunError> {
        for m in 0..self.slots.len() {
            self.schedule_slot(m);
        }
        loop {
            if self
                .pacer
                .done(self.timer.now(), self.slots[0].cycle_count)
            {
                return Ok(());
            }

            let m = self.earliest_slot();
            let local = self.slots[m].selector.select(self.ctx.random());
            let op_global = self.slots[m].ops[local];

            if !self
                .shared
                .stop
                .sleep_until(&self.timer, self.slots[m].invoke_time)
            {
                return Ok(());
            }

            match self.invoke(m, op_global)? {
                OpOutcome::Continue => {}
                OpOutcome::Stop => return Ok(()),
            }

            let slot = &mut self.slots[m];
            slot.prev_op = Some(local);
            slot.cycle_count += 1;
            self.schedule_slot(m);
        }
    }

    fn earliest_slot(&self) -> usize {
        let mut best = 0;
        for (i, slot) in self.slots.iter().enumerate().skip(1) {
            if slot.invoke_time < self.slots[best].invoke_time {
                best = i;
            }
        }
        best
    }

    /// Draw the delay governing the slot's next invocation. The first
    /// iteration draws from the slot's initial delay, afterwards from the
    /// cycle of the operation that just completed.
    fn schedule_slot(&mut self, m: usize) {
        let cycle = match self.slots[m].prev_op {
            None => self.slots[m].initial_delay,
            Some(local) => {
                let op_global = self.slots[m].ops[local];
                self.info.config.driver.operations[op_global].cycle
            }
        };
        let delay = cycle.draw(self.ctx.random());
        let slot = &mut self.slots[m];
        slot.invoke_time = self.pacer.next_invoke(&slot.clock, &cycle, delay);
    }

    /// Steps 4-7 of a tick: invoke, validate timing, classify, update phase
    fn invoke(&mut self, m: usize, op_global: usize) -> Result<OpOutcome, RunError> {
        let info = Arc::clone(&self.info);
        let op = &info.config.driver.operations[op_global];

        let start = self.timer.now();
        self.slots[m].clock.start_time = start;
        self.ctx.begin_operation(op_global);

        match self.driver.operate(op, &mut self.ctx) {
            Ok(()) => {
                self.validate_timing(op)?;
                let ti = *self.ctx.timing();
                self.slots[m].clock.end_time = ti.respond_time;
                if self.info.in_steady(ti.invoke_time, ti.respond_time) {
                    self.metrics
                        .record_success(op_global, ti.respond_time - ti.invoke_time);
                }
                self.update_phase(ti.invoke_time, ti.respond_time);
                Ok(OpOutcome::Continue)
            }
            Err(DriverError::Fatal(f)) => Err(self.raise_fatal(f)),
            Err(DriverError::Failed(e)) => {
                let ti = *self.ctx.timing();
                let end = if ti.respond_time != UNSET {
                    ti.respond_time
                } else {
                    self.timer.now()
                };
                self.slots[m].clock.end_time = end;
                if self.info.in_steady(start, end) {
                    warn!(
                        thread = self.thread_id,
                        op = %op.name,
                        "operation failed: {:#}",
                        e
                    );
                    self.metrics.record_failure(op_global);
                } else {
                    warn!(
                        thread = self.thread_id,
                        op = %op.name,
                        "operation failed: {:#}. Error not counted in result",
                        e
                    );
                }
                self.update_phase(start, end);
                Ok(OpOutcome::Continue)
            }
            Err(DriverError::Interrupted) => {
                if self.shared.stop.is_stopped() {
                    Ok(OpOutcome::Stop)
                } else {
                    Err(self.raise_fatal(FatalError::msg(format!(
                        "operation {} interrupted while the run is live",
                        op.name
                    ))))
                }
            }
        }
    }

    /// A successful return must have produced both timing stamps
    fn validate_timing(&mut self, op: &OperationDef) -> Result<(), RunError> {
        let ti = self.ctx.timing();
        if ti.invoke_time == UNSET {
            let msg = match op.timing {
                TimingMode::Auto => format!(
                    "Transport not called by operation {}; no invoke time recorded",
                    op.name
                ),
                TimingMode::Manual => format!(
                    "record_time not called before critical section in operation {}",
                    op.name
                ),
            };
            return Err(self.raise_fatal(FatalError::msg(msg)));
        }
        if ti.respond_time == UNSET {
            let msg = match op.timing {
                TimingMode::Auto => format!(
                    "Transport incomplete in operation {}; no respond time recorded",
                    op.name
                ),
                TimingMode::Manual => format!(
                    "record_time not called after critical section in operation {}",
                    op.name
                ),
            };
            return Err(self.raise_fatal(FatalError::msg(msg)));
        }
        Ok(())
    }

    /// `inRamp` flips to false on the first operation starting in steady
    /// state and back to true on the first operation ending in ramp-down
    fn update_phase(&mut self, start: i64, end: i64) {
        if !self.ctx.is_steady_state() {
            if start >= self.info.steady_start() && start < self.info.steady_end() {
                self.ctx.set_in_ramp(false);
            }
        } else if end >= self.info.steady_end() {
            self.ctx.set_in_ramp(true);
        }
    }

    /// Log a fatal error exactly once, ask the master to abort, and hand the
    /// error back for the thread to exit with
    fn raise_fatal(&self, fatal: FatalError) -> RunError {
        if !fatal.mark_logged() {
            error!(
                agent = self.agent_id,
                thread = self.thread_id,
                "fatal: {}",
                fatal
            );
        }
        self.request_abort();
        RunError::Fatal(fatal)
    }

    fn request_abort(&self) {
        if let Err(e) = self.master.abort_run() {
            error!("could not reach master to abort run: {}", e);
        }
    }

    /// Thread 0 runs the once-after hook when every thread has finished.
    /// The hook must complete exactly once unless the process itself is
    /// exiting, so a termination-interrupt is retried.
    fn run_post_hook(&mut self) {
        if !self.latches.post_run.wait_timeout(Duration::from_secs(10)) {
            warn!("threads still running 10s after workload end; running once-after hook anyway");
        }
        self.shared.state.advance(ThreadState::PostRun);
        loop {
            match self.driver.post_run(&mut self.ctx) {
                Ok(()) => return,
                Err(DriverError::Interrupted) => {
                    if self.shutting_down.load(Ordering::Relaxed) {
                        warn!("process shutting down; once-after hook abandoned");
                        return;
                    }
                    debug!("once-after hook interrupted during termination; retrying");
                }
                Err(e) => {
                    warn!("once-after hook failed: {}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::engine::master::MockMasterServices;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const CYCLE_RUN: &str = r#"
        [benchmark]
        short_name = "unit"

        [driver]
        name = "unit"
        threads = 1
        run_control = "cycles"
        cycles = 5

        [[driver.operations]]
        name = "ping"
        timing = "manual"
        cycle = { type = "cycletime", dist = "fixed", ms = 1 }

        [driver.foreground]
        mix = { type = "flat", weights = [1.0] }
    "#;

    fn run_info(toml_src: &str, bench_start: i64) -> Arc<RunInfo> {
        let config: RunConfig = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();
        Arc::new(RunInfo {
            run_id: format!("{}.1A", config.benchmark.short_name),
            bench_start_time: bench_start,
            config,
        })
    }

    /// Driver that stamps its timing and counts invocations per operation
    struct CountingDriver {
        counts: Arc<Vec<AtomicUsize>>,
        fail_fatal_at: Option<usize>,
        skip_stamps: bool,
        total: usize,
    }

    impl Driver for CountingDriver {
        fn operate(
            &mut self,
            _op: &OperationDef,
            ctx: &mut DriverContext,
        ) -> Result<(), DriverError> {
            self.total += 1;
            if let Some(n) = self.fail_fatal_at {
                if self.total >= n {
                    return Err(DriverError::fatal(anyhow::anyhow!("driver gave up")));
                }
            }
            if !self.skip_stamps {
                ctx.record_time();
                ctx.record_time();
            }
            self.counts[ctx.operation_id()].fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Harness {
        info: Arc<RunInfo>,
        shared: Arc<ThreadShared>,
        latches: Arc<RunLatches>,
        counts: Arc<Vec<AtomicUsize>>,
    }

    impl Harness {
        fn new(toml_src: &str, start_in_ms: i64) -> Self {
            let timer = Timer::new();
            let info = run_info(toml_src, timer.now() + start_in_ms);
            let ops = info.config.driver.operations.len();
            Self {
                info,
                shared: Arc::new(ThreadShared::new()),
                latches: Arc::new(RunLatches::new(1)),
                counts: Arc::new((0..ops).map(|_| AtomicUsize::new(0)).collect()),
            }
        }

        fn thread(
            &self,
            master: MockMasterServices,
            fail_fatal_at: Option<usize>,
            skip_stamps: bool,
        ) -> DriverThread {
            DriverThread::new(
                0,
                0,
                Arc::clone(&self.info),
                Timer::new(),
                Arc::new(master),
                Box::new(CountingDriver {
                    counts: Arc::clone(&self.counts),
                    fail_fatal_at,
                    skip_stamps,
                    total: 0,
                }),
                Arc::clone(&self.shared),
                Arc::clone(&self.latches),
                Arc::new(AtomicBool::new(false)),
            )
        }
    }

    #[test]
    fn test_cycle_run_completes_after_limit() {
        let h = Harness::new(CYCLE_RUN, 20);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().never();
        let worker = h.thread(master, None, false);
        h.latches.time_set.count_down();

        let (metrics, result) = worker.run();
        result.unwrap();
        // cycles = 5, no ramp: every invocation is measured.
        assert_eq!(metrics.total_success(), 5);
        assert_eq!(h.counts[0].load(Ordering::Relaxed), 5);
        assert_eq!(h.shared.state.get(), ThreadState::Ended);
        assert!(h.latches.post_run.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_fatal_driver_error_aborts_run() {
        let h = Harness::new(CYCLE_RUN, 20);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().times(1).returning(|| Ok(()));
        let worker = h.thread(master, Some(3), false);
        h.latches.time_set.count_down();

        let (_, result) = worker.run();
        match result {
            Err(RunError::Fatal(f)) => {
                assert!(f.mark_logged(), "fatal must have been logged on the way out")
            }
            other => panic!("expected fatal, got {:?}", other),
        }
        // The thread still ends and still releases the post-run barrier.
        assert_eq!(h.shared.state.get(), ThreadState::Ended);
        assert!(h.latches.post_run.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_missing_stamps_fail_validation() {
        let h = Harness::new(CYCLE_RUN, 20);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().times(1).returning(|| Ok(()));
        let worker = h.thread(master, None, true);
        h.latches.time_set.count_down();

        let (_, result) = worker.run();
        let err = result.unwrap_err().to_string();
        assert!(
            err.contains("record_time not called before critical section"),
            "{}",
            err
        );
    }

    #[test]
    fn test_expired_trigger_aborts() {
        // Bench start already in the past when the latch opens.
        let h = Harness::new(CYCLE_RUN, -50);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().times(1).returning(|| Ok(()));
        let worker = h.thread(master, None, false);
        h.latches.time_set.count_down();

        let (_, result) = worker.run();
        let err = result.unwrap_err().to_string();
        assert!(err.contains("TriggerTime has expired"), "{}", err);
        assert_eq!(h.shared.state.get(), ThreadState::Ended);
    }

    #[test]
    fn test_stop_during_start_wait_exits_cleanly() {
        let h = Harness::new(CYCLE_RUN, 60_000);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().never();
        let worker = h.thread(master, None, false);

        let shared = Arc::clone(&h.shared);
        let latches = Arc::clone(&h.latches);
        let join = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(30));
        shared.stop.stop();
        latches.time_set.open();

        let (metrics, result) = join.join().unwrap();
        result.unwrap();
        assert_eq!(metrics.total_success(), 0);
        assert_eq!(shared.state.get(), ThreadState::Ended);
    }

    const BACKGROUND_RUN: &str = r#"
        [benchmark]
        short_name = "unit"

        [run]
        steady_state = 1

        [driver]
        name = "unit"
        threads = 1

        [[driver.operations]]
        name = "fg"
        timing = "manual"
        cycle = { type = "cycletime", dist = "fixed", ms = 20 }

        [[driver.operations]]
        name = "bg"
        background = true
        timing = "manual"
        cycle = { type = "cycletime", dist = "fixed", ms = 50 }

        [driver.foreground]
        mix = { type = "flat", weights = [1.0] }

        [driver.background]
        mix = { type = "flat", weights = [1.0] }
    "#;

    #[test]
    fn test_background_mix_runs_in_parallel_clock() {
        let h = Harness::new(BACKGROUND_RUN, 20);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().never();
        let worker = h.thread(master, None, false);
        h.latches.time_set.count_down();

        let (metrics, result) = worker.run();
        result.unwrap();
        let fg = h.counts[0].load(Ordering::Relaxed);
        let bg = h.counts[1].load(Ordering::Relaxed);
        // One second of steady state: ~50 foreground ops at 20ms cycle,
        // ~20 background ops at 50ms cycle. Leave wide margins.
        assert!(fg >= 20, "foreground starved: {}", fg);
        assert!(bg >= 5, "background starved: {}", bg);
        assert!(
            metrics.total_success() as usize <= fg + bg,
            "measured more than invoked"
        );
    }

    /// Hooks run exactly once, on thread 0, in order
    struct HookDriver {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Driver for HookDriver {
        fn operate(
            &mut self,
            _op: &OperationDef,
            ctx: &mut DriverContext,
        ) -> Result<(), DriverError> {
            ctx.record_time();
            ctx.record_time();
            self.log.lock().unwrap().push("op");
            Ok(())
        }

        fn pre_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
            self.log.lock().unwrap().push("pre");
            Ok(())
        }

        fn post_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
            self.log.lock().unwrap().push("post");
            Ok(())
        }
    }

    #[test]
    fn test_hooks_bracket_the_workload() {
        let h = Harness::new(CYCLE_RUN, 20);
        let mut master = MockMasterServices::new();
        master.expect_abort_run().never();
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = DriverThread::new(
            0,
            0,
            Arc::clone(&h.info),
            Timer::new(),
            Arc::new(master),
            Box::new(HookDriver {
                log: Arc::clone(&log),
            }),
            Arc::clone(&h.shared),
            Arc::clone(&h.latches),
            Arc::new(AtomicBool::new(false)),
        );
        h.latches.time_set.count_down();
        let (_, result) = worker.run();
        result.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.first(), Some(&"pre"));
        assert_eq!(log.last(), Some(&"post"));
        assert_eq!(log.iter().filter(|s| **s == "pre").count(), 1);
        assert_eq!(log.iter().filter(|s| **s == "post").count(), 1);
        assert_eq!(log.iter().filter(|s| **s == "op").count(), 5);
    }
}
