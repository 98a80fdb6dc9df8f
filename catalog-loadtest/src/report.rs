//! Per-phase metrics and their terminal rendering.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::catalog::ActionError;
use crate::dataset::EntityKind;
use crate::error::Error;
use crate::workload::{ActionKind, Phase};

/// Outcomes and latencies of the actions of one phase.
#[derive(Clone, Default)]
pub struct PhaseMetrics {
    /// Latency of every action in seconds, failed ones included.
    pub timing: DDSketch,
    /// Number of successful actions.
    pub successes: u64,
    /// Number of failed actions per [`ActionError::label`].
    pub failures: BTreeMap<&'static str, u64>,
}

impl PhaseMetrics {
    /// Records a successful action that took `elapsed`.
    pub fn record_success(&mut self, elapsed: Duration) {
        self.timing.add(elapsed.as_secs_f64());
        self.successes += 1;
    }

    /// Records a failed action that took `elapsed`.
    pub fn record_failure(&mut self, error: &ActionError, elapsed: Duration) {
        self.timing.add(elapsed.as_secs_f64());
        *self.failures.entry(error.label()).or_default() += 1;
    }

    /// Total number of failed actions.
    pub fn failure_count(&self) -> u64 {
        self.failures.values().sum()
    }

    /// Adds the counts and latencies of `other`.
    pub fn merge(&mut self, other: &PhaseMetrics) {
        if let Err(error) = self.timing.merge(&other.timing) {
            tracing::warn!(%error, "failed to merge latency sketches");
        }
        self.successes += other.successes;
        for (&label, count) in &other.failures {
            *self.failures.entry(label).or_default() += count;
        }
    }
}

impl fmt::Debug for PhaseMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseMetrics")
            .field("timing", &format_args!("[{} samples]", self.timing.count()))
            .field("successes", &self.successes)
            .field("failures", &self.failures)
            .finish()
    }
}

/// Summary of one executed phase.
#[derive(Clone, Debug)]
pub struct PhaseReport {
    /// Name of the phase.
    pub name: String,
    /// The action the phase performed.
    pub action: ActionKind,
    /// The kind of entity the phase visited.
    pub kind: EntityKind,
    /// Number of workers.
    pub concurrency: usize,
    /// Number of actions the phase was meant to perform.
    pub target: u64,
    /// Outcomes and latencies.
    pub metrics: PhaseMetrics,
    /// Wall-clock time from the first claim until the last worker finished.
    pub elapsed: Duration,
}

impl PhaseReport {
    pub(crate) fn new(phase: &Phase, metrics: PhaseMetrics, elapsed: Duration) -> Self {
        Self {
            name: phase.name().to_owned(),
            action: phase.action(),
            kind: phase.kind(),
            concurrency: phase.concurrency(),
            target: phase.target(),
            metrics,
            elapsed,
        }
    }

    /// Number of actions performed, successful or not.
    pub fn processed(&self) -> u64 {
        self.metrics.successes + self.metrics.failure_count()
    }

    /// Returns `true` if every target action was performed.
    pub fn is_complete(&self) -> bool {
        self.processed() >= self.target
    }

    /// Processed actions per second.
    pub fn throughput(&self) -> f64 {
        per_second(self.processed(), self.elapsed)
    }
}

/// Summary of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Reports of the phases that started, in execution order.
    pub phases: Vec<PhaseReport>,
    /// Total wall-clock time of the run.
    pub elapsed: Duration,
    /// Why the run stopped early, if it did.
    pub aborted: Option<Error>,
}

impl RunReport {
    /// Returns `true` if the run was not aborted. Individual action failures do not count.
    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
    }

    /// Metrics of all phases combined.
    pub fn totals(&self) -> PhaseMetrics {
        let mut totals = PhaseMetrics::default();
        for phase in &self.phases {
            totals.merge(&phase.metrics);
        }
        totals
    }

    /// Renders the report to stdout.
    pub fn print(&self) {
        for phase in &self.phases {
            println!();
            println!(
                "{} {} ({} {}, concurrency: {})",
                "## Phase".bold(),
                phase.name.bold().blue(),
                phase.action,
                phase.kind,
                phase.concurrency.bold()
            );
            print_phase(phase);
        }

        println!();
        println!("{}", "## TOTALS".bold());
        let totals = self.totals();
        print_counts(&totals);
        print_throughput(per_second(totals.timing.count() as u64, self.elapsed));
        println!();
        if totals.timing.count() > 0 {
            print_percentiles(&totals.timing, Duration::from_secs_f64);
        }

        if let Some(error) = &self.aborted {
            println!();
            println!("{} {error}", "ABORTED:".bold().red());
        }
    }
}

fn print_phase(phase: &PhaseReport) {
    print_counts(&phase.metrics);
    if !phase.is_complete() {
        println!(
            "  {}",
            format!("incomplete: {}/{}", phase.processed(), phase.target).yellow()
        );
    }
    print_throughput(phase.throughput());
    println!("; elapsed: {:.2?}", phase.elapsed.bold());
    if phase.metrics.timing.count() > 0 {
        print_percentiles(&phase.metrics.timing, Duration::from_secs_f64);
    }
    if !phase.metrics.failures.is_empty() {
        let failures: Vec<_> = phase
            .metrics
            .failures
            .iter()
            .map(|(label, count)| format!("{label}: {count}"))
            .collect();
        println!("  failures: {}", failures.join(", ").red());
    }
}

fn print_counts(metrics: &PhaseMetrics) {
    print!(
        "{} ({} ops",
        "OK:".bold().green(),
        metrics.successes.bold()
    );
    let failures = metrics.failure_count();
    if failures > 0 {
        print!(", {}", format!("{failures} FAILURES").bold().red());
    }
    println!(")");
}

fn print_percentiles<T: fmt::Debug>(sketch: &DDSketch, map: impl Fn(f64) -> T) {
    let quantile = |q| sketch.quantile(q).ok().flatten().unwrap_or_default();
    let ops = sketch.count();
    let avg = map(sketch.sum().unwrap_or_default() / ops as f64);
    let p50 = map(quantile(0.5));
    let p90 = map(quantile(0.9));
    let p99 = map(quantile(0.99));
    println!(
        "  avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
        avg.bold()
    );
}

fn per_second(ops: u64, duration: Duration) -> f64 {
    let seconds = duration.as_secs_f64();
    if seconds > 0.0 {
        ops as f64 / seconds
    } else {
        0.0
    }
}

fn print_throughput(ops_ps: f64) {
    print!("  {:.2} operations/s", ops_ps.bold());
}
