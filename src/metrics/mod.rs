//! Prometheus metrics for fleet capture runs
//!
//! This module tracks:
//! - Broadcast latency: how long one signal pass across the fleet took,
//!   the only observable proxy for trigger skew between devices
//! - Per-phase device faults and phase durations
//! - Files collected and the number of live devices
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

use crate::transport::SignalKind;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all fleet metrics
struct FleetMetrics {
    broadcast_latency: HistogramVec,
    phase_duration: HistogramVec,
    device_faults: CounterVec,
    files_collected: Counter,
    bytes_collected: Counter,
    live_devices: Gauge,
}

/// Global storage for fleet metrics, or the reason registration failed
static FLEET_METRICS: OnceLock<Result<FleetMetrics, String>> = OnceLock::new();

fn fleet_metrics() -> Option<&'static FleetMetrics> {
    FLEET_METRICS.get().and_then(|m| m.as_ref().ok())
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Registration runs once; concurrent callers wait for it and later calls
/// return its outcome. If registration fails the error is returned and every
/// recording function stays a no-op.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = pifleet::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    match FLEET_METRICS.get_or_init(|| register_metrics().map_err(|e| e.to_string())) {
        Ok(_) => Ok(()),
        Err(reason) => Err(reason.clone().into()),
    }
}

fn register_metrics() -> Result<FleetMetrics, prometheus::Error> {
    let metrics = FleetMetrics {
        broadcast_latency: register_histogram_vec!(
            "pifleet_broadcast_latency_seconds",
            "Time to deliver one signal to every live device",
            &["signal"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
        )?,
        phase_duration: register_histogram_vec!(
            "pifleet_phase_duration_seconds",
            "Wall time spent in each lifecycle phase",
            &["phase"],
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )?,
        device_faults: register_counter_vec!(
            "pifleet_device_faults_total",
            "Per-device faults recorded, by lifecycle phase",
            &["phase"]
        )?,
        files_collected: register_counter!(
            "pifleet_files_collected_total",
            "Image files copied off devices"
        )?,
        bytes_collected: register_counter!(
            "pifleet_bytes_collected_total",
            "Bytes copied off devices"
        )?,
        live_devices: register_gauge!(
            "pifleet_live_devices",
            "Devices still taking part in the current run"
        )?,
    };

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(metrics)
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    fleet_metrics().is_some()
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

/// Record how long one broadcast pass took
pub fn record_broadcast(signal: SignalKind, latency: Duration) {
    if let Some(m) = fleet_metrics() {
        m.broadcast_latency
            .with_label_values(&[signal.as_str()])
            .observe(latency.as_secs_f64());
    }
}

/// Record per-device faults raised during a phase
pub fn record_device_faults(phase: &str, count: usize) {
    let Some(m) = fleet_metrics() else {
        return;
    };

    if count > 0 {
        m.device_faults
            .with_label_values(&[phase])
            .inc_by(count as f64);
    }
}

/// Record one collected file
pub fn record_file_collected(bytes: u64) {
    if let Some(m) = fleet_metrics() {
        m.files_collected.inc();
        m.bytes_collected.inc_by(bytes as f64);
    }
}

/// Update the live device gauge
pub fn update_live_devices(live: usize) {
    if let Some(m) = fleet_metrics() {
        m.live_devices.set(live as f64);
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

/// Start timing a lifecycle phase; the duration is recorded when the guard drops
pub fn start_phase_timer(phase: &str) -> MetricsTimer {
    match fleet_metrics() {
        Some(m) => MetricsTimer::new(m.phase_duration.with_label_values(&[phase]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
