//! Prometheus metrics for the printer fleet
//!
//! This module provides metrics tracking for:
//! - Tracker: poll outcomes and latency, devices per status, anomalies
//! - Energy: current load, admission decisions
//! - Scheduler: assignments per path, tick duration, queue depth
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec,
    Histogram, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all fleet metrics
struct FleetMetrics {
    polls: CounterVec,
    poll_duration: HistogramVec,
    devices_by_status: GaugeVec,
    anomalies: CounterVec,
    load_kw: Gauge,
    threshold_kw: Gauge,
    admissions: CounterVec,
    assignments: CounterVec,
    start_signal_failures: Counter,
    queue_depth: Gauge,
    tick_duration: Histogram,
}

static FLEET_METRICS: OnceLock<FleetMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = printfleet::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = FleetMetrics {
        polls: register_counter_vec!(
            "printfleet_tracker_polls_total",
            "Device status queries by outcome",
            &["outcome"]
        )?,
        poll_duration: register_histogram_vec!(
            "printfleet_tracker_poll_duration_seconds",
            "Device status query duration in seconds",
            &["outcome"],
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
        devices_by_status: register_gauge_vec!(
            "printfleet_devices",
            "Active devices by current status",
            &["status"]
        )?,
        anomalies: register_counter_vec!(
            "printfleet_tracker_anomalies_total",
            "Device anomalies raised by kind",
            &["kind"]
        )?,
        load_kw: register_gauge!(
            "printfleet_energy_load_kw",
            "Most recent aggregate load sample in kW"
        )?,
        threshold_kw: register_gauge!(
            "printfleet_energy_threshold_kw",
            "Current admission threshold in kW"
        )?,
        admissions: register_counter_vec!(
            "printfleet_energy_admissions_total",
            "Admission gate decisions",
            &["decision"]
        )?,
        assignments: register_counter_vec!(
            "printfleet_scheduler_assignments_total",
            "Committed assignments by path",
            &["path"]
        )?,
        start_signal_failures: register_counter!(
            "printfleet_scheduler_start_signal_failures_total",
            "Start signals the device did not accept"
        )?,
        queue_depth: register_gauge!(
            "printfleet_scheduler_queue_depth",
            "Queued entries waiting for a device"
        )?,
        tick_duration: register_histogram!(
            "printfleet_scheduler_tick_duration_seconds",
            "Matching tick duration in seconds",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
        )?,
    };

    FLEET_METRICS
        .set(metrics)
        .map_err(|_| "Fleet metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    FLEET_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one device status query
pub fn record_poll(reachable: bool, duration_secs: f64) {
    let Some(m) = FLEET_METRICS.get() else {
        return;
    };

    let outcome = if reachable { "ok" } else { "unreachable" };
    m.polls.with_label_values(&[outcome]).inc();
    m.poll_duration
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Replace the per-status device gauges
pub fn update_device_counts(counts: &[(&str, usize)]) {
    let Some(m) = FLEET_METRICS.get() else {
        return;
    };

    m.devices_by_status.reset();
    for (status, count) in counts {
        m.devices_by_status
            .with_label_values(&[status])
            .set(*count as f64);
    }
}

pub fn record_anomaly(kind: &str) {
    if let Some(m) = FLEET_METRICS.get() {
        m.anomalies.with_label_values(&[kind]).inc();
    }
}

/// Update load gauges from a sample
pub fn update_load(current_kw: f64, threshold_kw: f64) {
    if let Some(m) = FLEET_METRICS.get() {
        m.load_kw.set(current_kw);
        m.threshold_kw.set(threshold_kw);
    }
}

pub fn record_admission(allowed: bool) {
    if let Some(m) = FLEET_METRICS.get() {
        let decision = if allowed { "allowed" } else { "blocked" };
        m.admissions.with_label_values(&[decision]).inc();
    }
}

/// Record committed assignments (`path` is `tick` or `manual`)
pub fn record_assignments(path: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = FLEET_METRICS.get() {
        m.assignments
            .with_label_values(&[path])
            .inc_by(count as f64);
    }
}

pub fn record_start_signal_failure() {
    if let Some(m) = FLEET_METRICS.get() {
        m.start_signal_failures.inc();
    }
}

pub fn update_queue_depth(depth: usize) {
    if let Some(m) = FLEET_METRICS.get() {
        m.queue_depth.set(depth as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a tick timer (records when the guard drops)
pub fn start_tick_timer() -> MetricsTimer {
    match FLEET_METRICS.get() {
        Some(m) => MetricsTimer::new(m.tick_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
