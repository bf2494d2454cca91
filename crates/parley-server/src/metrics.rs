//! Metrics collection and export.
//!
//! Instrumentation uses the `metrics` crate and is exported in Prometheus
//! format. Service-level metrics are described here as well so the
//! exporter lists them from the start.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_service::metrics::names as service;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const FRAMES_TOTAL: &str = "parley_frames_total";
    pub const FRAMES_BYTES: &str = "parley_frames_bytes";
    pub const CHANNELS_ACTIVE: &str = "parley_channels_active";
    pub const LONGPOLL_TOTAL: &str = "parley_longpoll_total";
    pub const REQUEST_SECONDS: &str = "parley_request_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of live connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of live connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames exchanged");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames exchanged");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of broker channels");
    metrics::describe_counter!(names::LONGPOLL_TOTAL, "Long-poll requests by outcome");
    metrics::describe_histogram!(names::REQUEST_SECONDS, "Conversation request latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    metrics::describe_counter!(service::CACHE_HITS_TOTAL, "Cache reads served");
    metrics::describe_counter!(service::CACHE_MISSES_TOTAL, "Cache reads that fell back to the store");
    metrics::describe_counter!(
        service::BACKGROUND_FAILURES_TOTAL,
        "Background side effects that failed"
    );
    metrics::describe_counter!(
        service::BACKGROUND_DROPPED_TOTAL,
        "Background side effects dropped on a full queue"
    );
    metrics::describe_counter!(service::MESSAGES_STORED_TOTAL, "Messages stored");
    metrics::describe_counter!(service::EVENTS_PUBLISHED_TOTAL, "Events published to the broker");
    metrics::describe_counter!(service::PUSH_REQUESTS_TOTAL, "Push notifications requested");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_longpoll(outcome: &'static str) {
    counter!(names::LONGPOLL_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_request(route: &'static str, seconds: f64) {
    histogram!(names::REQUEST_SECONDS, "route" => route).record(seconds);
}

pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Records a disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
