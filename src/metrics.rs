//! Pipeline counters.
//!
//! Tracks collaborator calls, fix rounds, publish runs and cancellations.
//! Operator cancellations are counted on their own and never as failures.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

pub struct PipelineMetrics {
    translate_calls: AtomicUsize,
    translate_failures: AtomicUsize,
    analyze_calls: AtomicUsize,
    fix_rounds: AtomicUsize,
    publish_runs: AtomicUsize,
    publish_failures: AtomicUsize,
    cancellations: AtomicUsize,
}

static METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            translate_calls: AtomicUsize::new(0),
            translate_failures: AtomicUsize::new(0),
            analyze_calls: AtomicUsize::new(0),
            fix_rounds: AtomicUsize::new(0),
            publish_runs: AtomicUsize::new(0),
            publish_failures: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
        }
    }

    /// Get the process-wide metrics instance.
    pub fn global() -> &'static PipelineMetrics {
        METRICS.get_or_init(PipelineMetrics::new)
    }

    pub fn record_translate_call(&self) {
        self.translate_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_translate_failure(&self) {
        self.translate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analyze_call(&self) {
        self.analyze_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fix_round(&self) {
        self.fix_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_run(&self) {
        self.publish_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> MetricsReport {
        let translate_calls = self.translate_calls.load(Ordering::Relaxed);
        let translate_failures = self.translate_failures.load(Ordering::Relaxed);
        let translate_success_rate = if translate_calls > 0 {
            (translate_calls.saturating_sub(translate_failures) as f64 / translate_calls as f64)
                * 100.0
        } else {
            0.0
        };

        MetricsReport {
            translate_calls,
            translate_failures,
            translate_success_rate,
            analyze_calls: self.analyze_calls.load(Ordering::Relaxed),
            fix_rounds: self.fix_rounds.load(Ordering::Relaxed),
            publish_runs: self.publish_runs.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub translate_calls: usize,
    pub translate_failures: usize,
    /// Percentage (0-100)
    pub translate_success_rate: f64,
    pub analyze_calls: usize,
    pub fix_rounds: usize,
    pub publish_runs: usize,
    pub publish_failures: usize,
    pub cancellations: usize,
}
