//! Prometheus metrics for the manager, behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `sluice_jobs_added_total` - Jobs accepted onto a queue
//! - `sluice_jobs_completed_total` - Jobs archived, by exit status
//!
//! ## Gauges
//! - `sluice_queue_depth` - Current per-sub-queue depth
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for sluice metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs accepted onto a queue.
///
/// Labels:
/// - `queue`: The queue name
pub static JOBS_ADDED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("sluice_jobs_added_total", "Jobs accepted onto a queue");
    CounterVec::new(opts, &["queue"]).expect("sluice_jobs_added_total metric creation failed")
});

/// Counter for jobs archived.
///
/// Labels:
/// - `queue`: The queue name
/// - `status`: `success` or `failure`
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("sluice_jobs_completed_total", "Jobs archived");
    CounterVec::new(opts, &["queue", "status"])
        .expect("sluice_jobs_completed_total metric creation failed")
});

/// Gauge for current sub-queue depth.
///
/// Labels:
/// - `queue`: The queue name
/// - `sub_queue`: delay, ready, run, bury or dependent
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("sluice_queue_depth", "Current per-sub-queue depth");
    GaugeVec::new(opts, &["queue", "sub_queue"]).expect("sluice_queue_depth metric creation failed")
});

/// Register all metrics with the global registry; idempotent.
pub fn init_metrics() {
    let registry = &*REGISTRY;
    for metric in [
        Box::new(JOBS_ADDED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
    ] {
        let _ = registry.register(metric);
    }
}

pub fn record_job_added(queue: &str) {
    JOBS_ADDED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_job_completed(queue: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[queue, status])
        .inc();
}

pub fn set_queue_depth(queue: &str, stats: &crate::queue::QueueStats) {
    for (sub_queue, depth) in [
        ("delay", stats.delayed),
        ("ready", stats.ready),
        ("run", stats.running),
        ("bury", stats.buried),
        ("dependent", stats.dependent),
    ] {
        QUEUE_DEPTH
            .with_label_values(&[queue, sub_queue])
            .set(depth as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics();
        init_metrics();
        record_job_added("cmds");
        record_job_completed("cmds", true);
    }
}
