//! Prometheus metrics for the scheduler.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** constructing a
//! scheduler. The helper functions (`inc_admitted`, `set_active`, …) are
//! no-ops if `init_metrics` was never called, so the scheduler is always safe
//! to run and observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `scheduler_admitted_total` | Counter | `class` |
//! | `scheduler_rejected_total` | Counter | `class`, `reason` |
//! | `scheduler_completed_total` | Counter | `class`, `outcome` |
//! | `scheduler_preemptions_total` | Counter | `mode` |
//! | `scheduler_active` | Gauge | `class` |
//! | `scheduler_queue_depth` | Gauge | `class` |
//! | `scheduler_task_ceiling` | Gauge | |
//! | `scheduler_dispatch_latency_seconds` | Histogram | `class` |

use crate::SchedulerError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the scheduler, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Admitted requests per class.
    pub admitted_total: CounterVec,
    /// Refused admissions per class and reason.
    pub rejected_total: CounterVec,
    /// Terminal outcomes per class.
    pub completed_total: CounterVec,
    /// Preemptions per mode (`soft` ceiling cut, `hard` cancellation).
    pub preemptions_total: CounterVec,
    /// Slots held per class.
    pub active: IntGaugeVec,
    /// Queued requests per class.
    pub queue_depth: IntGaugeVec,
    /// Current task ceiling.
    pub task_ceiling: IntGauge,
    /// Dispatch-to-completion latency per class.
    pub dispatch_latency: HistogramVec,
}

impl Metrics {
    /// Build a bundle whose metric names start with `prefix`, registered
    /// with a fresh private registry.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`prometheus::Error`] if a descriptor is
    /// invalid or registered twice.
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let admitted_total = CounterVec::new(
            Opts::new(format!("{prefix}_admitted_total"), "Requests admitted to a queue"),
            &["class"],
        )?;
        registry.register(Box::new(admitted_total.clone()))?;

        let rejected_total = CounterVec::new(
            Opts::new(
                format!("{prefix}_rejected_total"),
                "Requests refused at admission",
            ),
            &["class", "reason"],
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let completed_total = CounterVec::new(
            Opts::new(
                format!("{prefix}_completed_total"),
                "Requests reaching a terminal state",
            ),
            &["class", "outcome"],
        )?;
        registry.register(Box::new(completed_total.clone()))?;

        let preemptions_total = CounterVec::new(
            Opts::new(
                format!("{prefix}_preemptions_total"),
                "Task capacity reclaimed for realtime work",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(preemptions_total.clone()))?;

        let active = IntGaugeVec::new(
            Opts::new(format!("{prefix}_active"), "Capacity slots held per class"),
            &["class"],
        )?;
        registry.register(Box::new(active.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new(format!("{prefix}_queue_depth"), "Queued requests per class"),
            &["class"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let task_ceiling = IntGauge::new(
            format!("{prefix}_task_ceiling"),
            "Current task concurrency ceiling",
        )?;
        registry.register(Box::new(task_ceiling.clone()))?;

        let dispatch_latency = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}_dispatch_latency_seconds"),
                "Dispatch to completion latency",
            )
            .buckets(vec![
                0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["class"],
        )?;
        registry.register(Box::new(dispatch_latency.clone()))?;

        Ok(Self {
            registry,
            admitted_total,
            rejected_total,
            completed_total,
            preemptions_total,
            active,
            queue_depth,
            task_ceiling,
            dispatch_latency,
        })
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`SchedulerError::Observability`] if metric construction or
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), SchedulerError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::new("scheduler")
        .map_err(|e| SchedulerError::Observability(format!("metrics init failed: {e}")))?;
    // If another thread raced us, the first one wins; both bundles are identical.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count an admission. No-op before [`init_metrics`].
pub fn inc_admitted(class: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.admitted_total.get_metric_with_label_values(&[class]) {
            c.inc();
        }
    }
}

/// Count a refused admission. No-op before [`init_metrics`].
pub fn inc_rejected(class: &str, reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.rejected_total.get_metric_with_label_values(&[class, reason]) {
            c.inc();
        }
    }
}

/// Count a terminal outcome (`success`, `failure`, `cancelled`).
pub fn inc_completed(class: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .completed_total
            .get_metric_with_label_values(&[class, outcome])
        {
            c.inc();
        }
    }
}

/// Count a preemption (`soft` or `hard`).
pub fn inc_preemption(mode: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.preemptions_total.get_metric_with_label_values(&[mode]) {
            c.inc();
        }
    }
}

/// Set the slots held by `class`.
pub fn set_active(class: &str, n: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.active.get_metric_with_label_values(&[class]) {
            g.set(i64::try_from(n).unwrap_or(i64::MAX));
        }
    }
}

/// Set the queue depth gauge for `class`.
pub fn set_queue_depth(class: &str, depth: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.queue_depth.get_metric_with_label_values(&[class]) {
            g.set(i64::try_from(depth).unwrap_or(i64::MAX));
        }
    }
}

/// Publish the task ceiling.
pub fn set_task_ceiling(ceiling: usize) {
    if let Some(m) = metrics() {
        m.task_ceiling
            .set(i64::try_from(ceiling).unwrap_or(i64::MAX));
    }
}

/// Record one dispatch-to-completion latency sample.
pub fn observe_dispatch_latency(class: &str, secs: f64) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.dispatch_latency.get_metric_with_label_values(&[class]) {
            h.observe(secs);
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    encode(&gather())
}

fn encode(families: &[prometheus::proto::MetricFamily]) -> String {
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of counter values, used by the health endpoint.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Admissions keyed by class.
    pub admitted_total: HashMap<String, u64>,
    /// Refusals keyed by `"class:reason"`.
    pub rejected_total: HashMap<String, u64>,
    /// Terminal outcomes keyed by `"class:outcome"`.
    pub completed_total: HashMap<String, u64>,
    /// Preemptions keyed by mode.
    pub preemptions_total: HashMap<String, u64>,
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    metrics().map_or_else(MetricsSummary::default, summarize)
}

fn label<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> &'a str {
    metric
        .get_label()
        .iter()
        .find(|l| l.get_name() == name)
        .map_or("unknown", |l| l.get_value())
}

fn collect_counter(vec: &CounterVec, labels: &[&str]) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = labels
                .iter()
                .map(|l| label(metric, l))
                .collect::<Vec<_>>()
                .join(":");
            out.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    out
}

fn summarize(m: &Metrics) -> MetricsSummary {
    MetricsSummary {
        admitted_total: collect_counter(&m.admitted_total, &["class"]),
        rejected_total: collect_counter(&m.rejected_total, &["class", "reason"]),
        completed_total: collect_counter(&m.completed_total, &["class", "outcome"]),
        preemptions_total: collect_counter(&m.preemptions_total, &["mode"]),
    }
}
