//! Per-thread counters and latency histograms, plus the aggregated report
//!
//! Each driver thread owns one [`Metrics`] instance; nothing is shared while
//! the run executes. After all threads have ended, the master merges the
//! per-thread instances (merging is commutative and associative) and renders
//! a [`RunSummary`] with one row per operation.
//!
//! Only operations whose `[invoke, respond]` interval lies entirely inside
//! the steady-state window are recorded; the driver thread performs that
//! check before calling into this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Histogram resolution: bucket count is fixed, bucket width comes from the
/// run settings. The last bucket collects overflow.
pub const HISTOGRAM_BUCKETS: usize = 100;

/// Counters for one operation on one thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpMetrics {
    /// Operation name, carried for reporting
    pub name: String,
    /// Successful invocations inside steady state
    pub success: u64,
    /// Failed invocations inside steady state
    pub failure: u64,
    /// Sum of latencies (ms)
    pub latency_sum: i64,
    /// Sum of squared latencies, for the running standard deviation
    pub latency_sq_sum: f64,
    /// Smallest latency seen, ms (meaningless when `success == 0`)
    pub min: i64,
    /// Largest latency seen, ms
    pub max: i64,
    /// Latency histogram
    pub histogram: Vec<u64>,
}

impl OpMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: 0,
            failure: 0,
            latency_sum: 0,
            latency_sq_sum: 0.0,
            min: i64::MAX,
            max: 0,
            histogram: vec![0; HISTOGRAM_BUCKETS],
        }
    }

    fn merge(&mut self, other: &OpMetrics) {
        self.success += other.success;
        self.failure += other.failure;
        self.latency_sum += other.latency_sum;
        self.latency_sq_sum += other.latency_sq_sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for (mine, theirs) in self.histogram.iter_mut().zip(&other.histogram) {
            *mine += theirs;
        }
    }
}

/// All per-operation counters for one driver thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub agent_id: usize,
    pub thread_id: usize,
    bucket_ms: i64,
    ops: Vec<OpMetrics>,
}

impl Metrics {
    pub fn new(agent_id: usize, thread_id: usize, op_names: &[String], bucket_ms: i64) -> Self {
        Self {
            agent_id,
            thread_id,
            bucket_ms: bucket_ms.max(1),
            ops: op_names.iter().map(|n| OpMetrics::new(n)).collect(),
        }
    }

    /// Record one successful steady-state invocation
    pub fn record_success(&mut self, op: usize, latency_ms: i64) {
        let latency = latency_ms.max(0);
        let stats = &mut self.ops[op];
        stats.success += 1;
        stats.latency_sum += latency;
        stats.latency_sq_sum += (latency as f64) * (latency as f64);
        stats.min = stats.min.min(latency);
        stats.max = stats.max.max(latency);
        let bucket = ((latency / self.bucket_ms) as usize).min(HISTOGRAM_BUCKETS - 1);
        stats.histogram[bucket] += 1;
    }

    /// Record one failed steady-state invocation
    pub fn record_failure(&mut self, op: usize) {
        self.ops[op].failure += 1;
    }

    /// Fold another thread's metrics into this one.
    /// Both sides must describe the same operation table.
    pub fn merge(&mut self, other: &Metrics) {
        debug_assert_eq!(self.ops.len(), other.ops.len());
        debug_assert_eq!(self.bucket_ms, other.bucket_ms);
        for (mine, theirs) in self.ops.iter_mut().zip(&other.ops) {
            mine.merge(theirs);
        }
    }

    pub fn ops(&self) -> &[OpMetrics] {
        &self.ops
    }

    pub fn total_success(&self) -> u64 {
        self.ops.iter().map(|o| o.success).sum()
    }

    pub fn total_failure(&self) -> u64 {
        self.ops.iter().map(|o| o.failure).sum()
    }

    /// Latency below which `fraction` of successes fall, estimated from the
    /// histogram (upper bucket bound). Returns `None` with no successes.
    fn percentile(&self, op: usize, fraction: f64) -> Option<i64> {
        let stats = &self.ops[op];
        if stats.success == 0 {
            return None;
        }
        let target = (stats.success as f64 * fraction).ceil() as u64;
        let mut seen = 0u64;
        for (i, &count) in stats.histogram.iter().enumerate() {
            seen += count;
            if seen >= target {
                if i == HISTOGRAM_BUCKETS - 1 {
                    // Overflow bucket: the histogram cannot resolve it.
                    return Some(stats.max);
                }
                return Some((i as i64 + 1) * self.bucket_ms);
            }
        }
        Some(stats.max)
    }
}

// ---------------------------------------------------------------------------
// Aggregated report
// ---------------------------------------------------------------------------

/// One report row per operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpSummary {
    pub name: String,
    pub count: u64,
    pub errors: u64,
    /// Successes per second over the steady-state window
    pub throughput: f64,
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub p90_ms: i64,
}

/// The final metrics report for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub benchmark: String,
    pub aborted: bool,
    pub generated_at: DateTime<Utc>,
    /// Steady-state length used for throughput, seconds
    pub steady_seconds: u32,
    pub threads: usize,
    pub operations: Vec<OpSummary>,
}

impl RunSummary {
    /// Merge per-thread metrics into the final report.
    ///
    /// One entry per thread; all entries must share the same operation
    /// table. An empty slice produces an empty report.
    pub fn aggregate(
        run_id: &str,
        benchmark: &str,
        aborted: bool,
        steady_seconds: u32,
        metrics: &[Metrics],
    ) -> Self {
        let mut operations = Vec::new();
        if let Some((first, rest)) = metrics.split_first() {
            let mut total = first.clone();
            for m in rest {
                total.merge(m);
            }
            let window = steady_seconds.max(1) as f64;
            for (i, op) in total.ops().iter().enumerate() {
                let mean = if op.success > 0 {
                    op.latency_sum as f64 / op.success as f64
                } else {
                    0.0
                };
                // Sample standard deviation from the streaming sums; the
                // per-thread accumulators never retain raw samples.
                let std_dev = if op.success > 1 {
                    let n = op.success as f64;
                    let var = (op.latency_sq_sum - n * mean * mean) / (n - 1.0);
                    var.max(0.0).sqrt()
                } else {
                    0.0
                };
                operations.push(OpSummary {
                    name: op.name.clone(),
                    count: op.success,
                    errors: op.failure,
                    throughput: op.success as f64 / window,
                    mean_ms: mean,
                    std_dev_ms: std_dev,
                    min_ms: if op.success > 0 { op.min } else { 0 },
                    max_ms: op.max,
                    p90_ms: total.percentile(i, 0.90).unwrap_or(0),
                });
            }
        }
        Self {
            run_id: run_id.to_string(),
            benchmark: benchmark.to_string(),
            aborted,
            generated_at: Utc::now(),
            steady_seconds,
            threads: metrics.len(),
            operations,
        }
    }

    /// Plain-text report table
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Run {}  benchmark={}  threads={}  steady={}s{}\n",
            self.run_id,
            self.benchmark,
            self.threads,
            self.steady_seconds,
            if self.aborted { "  [ABORTED]" } else { "" },
        ));
        out.push_str(&format!(
            "{:<24} {:>10} {:>8} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8}\n",
            "operation", "count", "errors", "ops/s", "mean ms", "stdev ms", "min", "max", "p90",
        ));
        for op in &self.operations {
            out.push_str(&format!(
                "{:<24} {:>10} {:>8} {:>10.2} {:>10.2} {:>10.2} {:>8} {:>8} {:>8}\n",
                op.name,
                op.count,
                op.errors,
                op.throughput,
                op.mean_ms,
                op.std_dev_ms,
                op.min_ms,
                op.max_ms,
                op.p90_ms,
            ));
        }
        out
    }
}
